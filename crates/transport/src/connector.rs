//! Connection seam: how a Transport obtains a stream of text frames.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::stream::{BoxStream, StreamExt};
use kdash_core::WatchEvent;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Text frames of one connection. The stream ending means the peer closed.
pub type FrameStream = BoxStream<'static, Result<String>>;

#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<FrameStream>;
}

/// Websocket connector backed by tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<FrameStream> {
        let (ws, resp) = tokio_tungstenite::connect_async(url)
            .await
            .with_context(|| format!("websocket connect to {}", url))?;
        debug!(url = %url, status = %resp.status(), "websocket handshake ok");
        let frames = ws.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => Some(String::from_utf8(bytes).context("binary frame is not utf-8")),
                // Close is followed by end of stream; pings are answered by tungstenite.
                Ok(_) => None,
                Err(e) => Some(Err(anyhow::Error::from(e))),
            }
        });
        Ok(frames.boxed())
    }
}

struct MemoryConn {
    url: String,
    tx: Option<mpsc::UnboundedSender<Result<String>>>,
}

impl MemoryConn {
    fn is_live(&self) -> bool {
        self.tx.as_ref().map(|tx| !tx.is_closed()).unwrap_or(false)
    }
}

/// In-process connector for tests and demos.
///
/// Every `connect` opens a channel-backed connection; callers push frames to
/// the newest live connection whose URL contains a fragment, or drop it to
/// simulate an abnormal close.
#[derive(Default)]
pub struct MemoryConnector {
    conns: Mutex<Vec<MemoryConn>>,
    refuse: Mutex<bool>,
    attempts: Mutex<usize>,
}

impl MemoryConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Total connections ever opened.
    pub fn opened(&self) -> usize {
        self.conns.lock().len()
    }

    /// Connect calls, including refused ones.
    pub fn attempts(&self) -> usize {
        *self.attempts.lock()
    }

    /// Connections whose reader is still attached.
    pub fn live(&self) -> usize {
        self.conns.lock().iter().filter(|c| c.is_live()).count()
    }

    pub fn urls(&self) -> Vec<String> {
        self.conns.lock().iter().map(|c| c.url.clone()).collect()
    }

    /// Make subsequent connects fail.
    pub fn set_refuse(&self, refuse: bool) {
        *self.refuse.lock() = refuse;
    }

    fn with_newest<R>(&self, fragment: &str, f: impl FnOnce(&mut MemoryConn) -> R) -> Option<R> {
        let mut conns = self.conns.lock();
        conns.iter_mut().rev().find(|c| c.url.contains(fragment) && c.is_live()).map(f)
    }

    /// Deliver a raw text frame. Returns false when no live connection matches.
    pub fn push(&self, fragment: &str, frame: impl Into<String>) -> bool {
        let frame = frame.into();
        self.with_newest(fragment, |c| c.tx.as_ref().map(|tx| tx.send(Ok(frame)).is_ok()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Deliver a domain event encoded in wire form.
    pub fn push_event(&self, fragment: &str, ev: &WatchEvent) -> bool {
        match serde_json::to_string(&ev.to_wire()) {
            Ok(text) => self.push(fragment, text),
            Err(_) => false,
        }
    }

    /// Deliver a read error, which the transport treats as an abnormal close.
    pub fn fail(&self, fragment: &str, reason: &str) -> bool {
        let err = anyhow!("{}", reason);
        self.with_newest(fragment, |c| c.tx.as_ref().map(|tx| tx.send(Err(err)).is_ok()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// End the newest matching connection without a CLOSED frame.
    pub fn disconnect(&self, fragment: &str) -> bool {
        self.with_newest(fragment, |c| c.tx.take().is_some()).unwrap_or(false)
    }
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<FrameStream> {
        *self.attempts.lock() += 1;
        if *self.refuse.lock() {
            return Err(anyhow!("connection refused: {}", url));
        }
        let (tx, rx) = mpsc::unbounded_channel::<Result<String>>();
        self.conns.lock().push(MemoryConn { url: url.to_string(), tx: Some(tx) });
        let frames = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|f| (f, rx)) });
        Ok(frames.boxed())
    }
}
