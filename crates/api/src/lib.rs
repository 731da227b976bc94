//! kdash subscription registry.
//!
//! Consumers declare interest in a `(kind, environment)` pair or in a pod's
//! log stream; the registry keeps at most one transport per key, runs the
//! initial-snapshot and log debounce, and feeds the shared normalized store.
//! Readers get a lock-free [`StoreReader`] plus an epoch channel to re-render on.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kdash_core::{LabelSelector, ResourceKind, UnknownKind, WatchEvent, POD_LOG_PATH};
use kdash_store::{Field, LogEvent, StoreWriter};
use kdash_transport::{stream_url, Connector, TransportHandle};
use metrics::{gauge, histogram};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

pub mod buffer;
pub mod config;

pub use buffer::{Debounce, InitGate, Phase};
pub use config::SyncConfig;
pub use kdash_store::{Record, StoreReader, World};

#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum SyncError {
    #[error("config: {0}")]
    Config(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("field: {0}")]
    Field(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl From<UnknownKind> for SyncError {
    fn from(e: UnknownKind) -> Self { SyncError::Validation(e.to_string()) }
}

/// Server-side filters forwarded as query parameters on a resource stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilter {
    pub label_selector: Option<LabelSelector>,
    pub field_selector: Option<String>,
    /// Passed through verbatim, after the named filters.
    pub extra: Vec<(String, String)>,
}

impl QueryFilter {
    pub fn labels(sel: LabelSelector) -> Self {
        Self { label_selector: Some(sel), ..Self::default() }
    }

    /// Query pairs for `env`; `environment` always comes first.
    pub fn to_query(&self, env: &str) -> Vec<(String, String)> {
        let mut q = vec![("environment".to_string(), env.to_string())];
        if let Some(sel) = self.label_selector.as_ref().filter(|s| !s.is_empty()) {
            q.push(("labelSelector".to_string(), sel.to_string()));
        }
        if let Some(fs) = self.field_selector.as_ref().filter(|s| !s.is_empty()) {
            q.push(("fieldSelector".to_string(), fs.clone()));
        }
        q.extend(self.extra.iter().cloned());
        q
    }
}

/// Fetches supplementary per-object data (spec, repository, service) on demand.
#[async_trait::async_trait]
pub trait FieldSource: Send + Sync {
    async fn fetch(&self, kind: ResourceKind, env: &str, name: &str, field: Field) -> anyhow::Result<Value>;
}

/// In-memory field source for tests and demos.
#[derive(Default)]
pub struct StaticFieldSource {
    values: Mutex<FxHashMap<(ResourceKind, String, String, Field), Value>>,
}

impl StaticFieldSource {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&self, kind: ResourceKind, env: &str, name: &str, field: Field, value: Value) {
        self.values.lock().insert((kind, env.to_string(), name.to_string(), field), value);
    }
}

#[async_trait::async_trait]
impl FieldSource for StaticFieldSource {
    async fn fetch(&self, kind: ResourceKind, env: &str, name: &str, field: Field) -> anyhow::Result<Value> {
        self.values
            .lock()
            .get(&(kind, env.to_string(), name.to_string(), field))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no {:?} for {}/{}/{}", field, kind, env, name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchKey {
    pub kind: ResourceKind,
    pub env: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogKey {
    pub env: String,
    pub pod: String,
}

struct WatchEntry {
    transport: TransportHandle,
    consumers: usize,
}

/// Owner of every live stream and of the store they feed.
pub struct Registry {
    cfg: SyncConfig,
    connector: Arc<dyn Connector>,
    fields: Option<Arc<dyn FieldSource>>,
    writer: Arc<StoreWriter>,
    watches: Mutex<FxHashMap<WatchKey, WatchEntry>>,
    logs: Mutex<FxHashMap<LogKey, TransportHandle>>,
}

impl Registry {
    pub fn new(cfg: SyncConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            cfg,
            connector,
            fields: None,
            writer: Arc::new(StoreWriter::new()),
            watches: Mutex::new(FxHashMap::default()),
            logs: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn with_field_source(mut self, source: Arc<dyn FieldSource>) -> Self {
        self.fields = Some(source);
        self
    }

    pub fn config(&self) -> &SyncConfig { &self.cfg }

    pub fn reader(&self) -> StoreReader { self.writer.reader() }

    /// Register one consumer of `(kind, env)`. The first consumer opens the
    /// stream; later ones only bump the count. A stream the server ended is
    /// reopened, keeping its consumers. `filter` applies only when the stream
    /// is opened.
    ///
    /// Must be called within a tokio runtime.
    pub fn subscribe(&self, kind: ResourceKind, env: &str, filter: Option<&QueryFilter>) -> SyncResult<()> {
        let key = WatchKey { kind, env: env.to_string() };
        let mut watches = self.watches.lock();
        let mut consumers = 1;
        if let Some(entry) = watches.get_mut(&key) {
            if !entry.transport.is_closed() {
                entry.consumers += 1;
                debug!(kind = %kind, env = %env, consumers = entry.consumers, "registry: already subscribed");
                return Ok(());
            }
            consumers = entry.consumers + 1;
            info!(kind = %kind, env = %env, "registry: stream ended by server, reopening");
        }
        let query = filter.cloned().unwrap_or_default().to_query(env);
        let (transport, rx) = self.open_stream(&kind.watch_path(), &query)?;
        tokio::spawn(pump_watch(kind, env.to_string(), rx, Arc::clone(&self.writer), self.cfg.debounce()));
        info!(kind = %kind, env = %env, id = %transport.id(), consumers, "registry: subscribed");
        watches.insert(key, WatchEntry { transport, consumers });
        gauge!("registry_watches", watches.len() as f64);
        Ok(())
    }

    /// Drop one consumer of `(kind, env)`; the last one closes the stream.
    /// Unknown keys are ignored.
    pub fn unsubscribe(&self, kind: ResourceKind, env: &str) {
        let key = WatchKey { kind, env: env.to_string() };
        let mut watches = self.watches.lock();
        let last = match watches.get_mut(&key) {
            Some(entry) => {
                entry.consumers = entry.consumers.saturating_sub(1);
                entry.consumers == 0
            }
            None => return,
        };
        if last {
            if let Some(entry) = watches.remove(&key) {
                entry.transport.close();
                info!(kind = %kind, env = %env, "registry: unsubscribed");
            }
            gauge!("registry_watches", watches.len() as f64);
        }
    }

    /// Stream the logs of `pod` into its record. Idempotent per `(env, pod)`
    /// while the stream is live; a stream the server ended is reopened.
    ///
    /// Must be called within a tokio runtime.
    pub fn subscribe_log(&self, env: &str, pod: &str) -> SyncResult<()> {
        let key = LogKey { env: env.to_string(), pod: pod.to_string() };
        let mut logs = self.logs.lock();
        if logs.get(&key).is_some_and(|t| !t.is_closed()) {
            return Ok(());
        }
        let query = [("environment".to_string(), env.to_string()), ("name".to_string(), pod.to_string())];
        let (transport, rx) = self.open_stream(POD_LOG_PATH, &query)?;
        tokio::spawn(pump_log(key.clone(), rx, Arc::clone(&self.writer), self.cfg.debounce()));
        info!(env = %env, pod = %pod, id = %transport.id(), "registry: log subscribed");
        logs.insert(key, transport);
        gauge!("registry_logs", logs.len() as f64);
        Ok(())
    }

    fn open_stream(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> SyncResult<(TransportHandle, mpsc::UnboundedReceiver<WatchEvent>)> {
        let url = stream_url(&self.cfg.origin, path, query).map_err(|e| SyncError::Validation(e.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = kdash_transport::open(Arc::clone(&self.connector), url, self.cfg.reconnect_delay(), move |ev| {
            let _ = tx.send(ev);
        });
        Ok((transport, rx))
    }

    pub fn unsubscribe_log(&self, env: &str, pod: &str) {
        let mut logs = self.logs.lock();
        if let Some(transport) = logs.remove(&LogKey { env: env.to_string(), pod: pod.to_string() }) {
            transport.close();
            info!(env = %env, pod = %pod, "registry: log unsubscribed");
            gauge!("registry_logs", logs.len() as f64);
        }
    }

    /// Store a supplementary field on a record, creating the record if needed.
    pub fn set_field(&self, kind: ResourceKind, env: &str, name: &str, field: Field, value: Value) -> u64 {
        self.writer.set_field(kind, env, name, field, value)
    }

    /// Fetch `field` from the configured source and store it.
    pub async fn refresh_field(&self, kind: ResourceKind, env: &str, name: &str, field: Field) -> SyncResult<u64> {
        let source = self
            .fields
            .as_ref()
            .ok_or_else(|| SyncError::Unavailable("no field source configured".into()))?;
        let value = source
            .fetch(kind, env, name, field)
            .await
            .map_err(|e| SyncError::Field(e.to_string()))?;
        Ok(self.set_field(kind, env, name, field, value))
    }

    /// Current record for `(kind, env, name)`.
    pub fn get(&self, kind: ResourceKind, env: &str, name: &str) -> SyncResult<Record> {
        self.writer
            .reader()
            .lookup_by_name(kind, env, name)
            .ok_or_else(|| SyncError::NotFound(format!("{}/{}/{}", kind, env, name)))
    }

    /// A live stream exists for `(kind, env)`.
    pub fn is_subscribed(&self, kind: ResourceKind, env: &str) -> bool {
        self.watches
            .lock()
            .get(&WatchKey { kind, env: env.to_string() })
            .is_some_and(|e| !e.transport.is_closed())
    }

    /// Consumer count for `(kind, env)`; zero when not subscribed.
    pub fn consumers(&self, kind: ResourceKind, env: &str) -> usize {
        self.watches.lock().get(&WatchKey { kind, env: env.to_string() }).map(|e| e.consumers).unwrap_or(0)
    }

    pub fn active_watches(&self) -> Vec<WatchKey> {
        let mut keys: Vec<WatchKey> = self
            .watches
            .lock()
            .iter()
            .filter(|(_, e)| !e.transport.is_closed())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort_by(|a, b| (a.kind, &a.env).cmp(&(b.kind, &b.env)));
        keys
    }

    pub fn active_logs(&self) -> Vec<LogKey> {
        let mut keys: Vec<LogKey> = self
            .logs
            .lock()
            .iter()
            .filter(|(_, t)| !t.is_closed())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort_by(|a, b| (&a.env, &a.pod).cmp(&(&b.env, &b.pod)));
        keys
    }

    /// Close every stream. The store keeps its contents.
    pub fn shutdown(&self) {
        let watches = std::mem::take(&mut *self.watches.lock());
        let logs = std::mem::take(&mut *self.logs.lock());
        if !watches.is_empty() || !logs.is_empty() {
            info!(watches = watches.len(), logs = logs.len(), "registry: shutdown");
        }
        for entry in watches.into_values() {
            entry.transport.close();
        }
        for transport in logs.into_values() {
            transport.close();
        }
        gauge!("registry_watches", 0.0);
        gauge!("registry_logs", 0.0);
    }
}

impl Drop for Registry {
    fn drop(&mut self) { self.shutdown(); }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

fn commit_init(writer: &StoreWriter, kind: ResourceKind, env: &str, init: WatchEvent) {
    if let WatchEvent::Init(list) = &init {
        histogram!("registry_init_flush_items", list.len() as f64);
        debug!(kind = %kind, env = %env, items = list.len(), "registry: initial snapshot");
    }
    writer.apply(kind, env, init);
}

/// Drains one resource stream into the store. Exits once the transport is
/// gone, committing any snapshot still being buffered.
async fn pump_watch(
    kind: ResourceKind,
    env: String,
    mut rx: mpsc::UnboundedReceiver<WatchEvent>,
    writer: Arc<StoreWriter>,
    window: Duration,
) {
    let mut gate = InitGate::new(window);
    loop {
        tokio::select! {
            ev = rx.recv() => match ev {
                Some(ev) => match gate.offer(ev, Instant::now()) {
                    Some(init @ WatchEvent::Init(_)) => commit_init(&writer, kind, &env, init),
                    Some(ev) => { writer.apply(kind, &env, ev); }
                    None => {}
                },
                None => break,
            },
            _ = sleep_until_opt(gate.deadline()) => {
                if let Some(init) = gate.flush() {
                    commit_init(&writer, kind, &env, init);
                }
            }
        }
    }
    if let Some(init) = gate.flush() {
        commit_init(&writer, kind, &env, init);
    }
    debug!(kind = %kind, env = %env, "registry: watch pump exited");
}

async fn pump_log(key: LogKey, mut rx: mpsc::UnboundedReceiver<WatchEvent>, writer: Arc<StoreWriter>, window: Duration) {
    let mut batch: Debounce<LogEvent> = Debounce::new(window);
    loop {
        tokio::select! {
            ev = rx.recv() => match ev {
                Some(ev) => {
                    if let Some(le) = LogEvent::from_watch(ev) {
                        batch.push(le, Instant::now());
                    }
                }
                None => break,
            },
            _ = sleep_until_opt(batch.deadline()) => {
                writer.append_logs(&key.env, &key.pod, &batch.take());
            }
        }
    }
    if !batch.is_empty() {
        writer.append_logs(&key.env, &key.pod, &batch.take());
    }
    debug!(env = %key.env, pod = %key.pod, "registry: log pump exited");
}
