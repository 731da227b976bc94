//! kdash transport: one reconnecting watch stream per subscription.
//!
//! A transport owns a single connection, decodes each text frame and hands
//! domain events to its callback. An abnormal close reopens the same URL
//! after a fixed delay, forever; an explicit `close()` or a `CLOSED` frame
//! ends it for good.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kdash_core::{decode_frame, Frame, WatchEvent};
use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod connector;
pub mod url;

pub use connector::{Connector, FrameStream, MemoryConnector, WsConnector};
pub use url::{encode_query, stream_url};

/// Fixed delay between an abnormal close and the next connect attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Handle to a running transport. Dropping it closes the transport.
pub struct TransportHandle {
    id: Uuid,
    url: String,
    closed: Arc<watch::Sender<bool>>,
    task: JoinHandle<()>,
}

impl TransportHandle {
    pub fn id(&self) -> Uuid { self.id }
    pub fn url(&self) -> &str { &self.url }

    /// Set the closed-by-caller flag; the read loop and any pending reconnect
    /// observe it and exit without reconnecting.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Closed by the caller or by an end-of-stream frame.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// The background task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.closed.send_replace(true);
    }
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Open a transport to `url`. Must be called within a tokio runtime.
pub fn open<F>(
    connector: Arc<dyn Connector>,
    url: impl Into<String>,
    reconnect_delay: Duration,
    on_message: F,
) -> TransportHandle
where
    F: Fn(WatchEvent) + Send + Sync + 'static,
{
    let id = Uuid::new_v4();
    let url = url.into();
    let (closed_tx, _) = watch::channel(false);
    let closed = Arc::new(closed_tx);
    let task = tokio::spawn(run(id, connector, url.clone(), reconnect_delay, on_message, Arc::clone(&closed)));
    info!(%id, url = %url, "transport: opened");
    TransportHandle { id, url, closed, task }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    // The task keeps a sender alive, so this only returns once the flag is set.
    let _ = rx.wait_for(|closed| *closed).await;
}

async fn run<F>(
    id: Uuid,
    connector: Arc<dyn Connector>,
    url: String,
    reconnect_delay: Duration,
    on_message: F,
    closed: Arc<watch::Sender<bool>>,
) where
    F: Fn(WatchEvent) + Send + Sync + 'static,
{
    let mut closed_rx = closed.subscribe();
    let mut attempt: u64 = 0;
    loop {
        if *closed_rx.borrow() {
            break;
        }
        if attempt > 0 {
            counter!("transport_reconnects_total", 1u64);
            info!(%id, attempt, "transport: reconnecting");
        }
        attempt += 1;
        let connected = tokio::select! {
            biased;
            _ = wait_closed(&mut closed_rx) => break,
            res = connector.connect(&url) => res,
        };
        match connected {
            Ok(mut frames) => {
                counter!("transport_connects_total", 1u64);
                debug!(%id, url = %url, "transport: connected");
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = wait_closed(&mut closed_rx) => {
                            debug!(%id, "transport: closed by caller");
                            return;
                        }
                        next = frames.next() => next,
                    };
                    match next {
                        Some(Ok(text)) => {
                            counter!("transport_frames_total", 1u64);
                            match decode_frame(&text) {
                                Ok(Frame::Event(ev)) => on_message(ev),
                                Ok(Frame::Closed) => {
                                    info!(%id, "transport: end of stream");
                                    closed.send_replace(true);
                                    return;
                                }
                                Err(e) => {
                                    counter!("transport_frames_dropped_total", 1u64);
                                    warn!(%id, error = %e, "transport: dropping undecodable frame");
                                }
                            }
                        }
                        Some(Err(e)) => {
                            warn!(%id, error = %e, "transport: read failed");
                            break;
                        }
                        None => {
                            warn!(%id, "transport: connection closed unexpectedly");
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!(%id, error = %e, "transport: connect failed"),
        }
        // Fixed delay, no backoff, no cap.
        tokio::select! {
            biased;
            _ = wait_closed(&mut closed_rx) => break,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
    }
    debug!(%id, "transport: task exited");
}
