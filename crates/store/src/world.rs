//! Published world: one store per kind behind an `ArcSwap`, with a single writer.

use std::sync::Arc;

use arc_swap::ArcSwap;
use kdash_core::{Resource, ResourceKind, WatchEvent};
use metrics::{counter, histogram};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::{append_batch, apply, Field, LogEvent, Record, Store};

/// Epoch-stamped snapshot of every store. Cheap to clone and to read.
#[derive(Debug, Clone, Default)]
pub struct World {
    pub epoch: u64,
    stores: FxHashMap<ResourceKind, Arc<Store>>,
}

impl World {
    pub fn store(&self, kind: ResourceKind) -> Option<&Store> {
        self.stores.get(&kind).map(|s| s.as_ref())
    }

    pub fn lookup_by_name(&self, kind: ResourceKind, env: &str, name: &str) -> Option<&Record> {
        self.store(kind).and_then(|s| s.lookup_by_name(env, name))
    }

    pub fn lookup_objects(&self, kind: ResourceKind, env: &str) -> FxHashMap<String, Resource> {
        self.store(kind).map(|s| s.lookup_objects(env)).unwrap_or_default()
    }
}

/// Read side handed to consumers.
#[derive(Clone)]
pub struct StoreReader {
    snap: Arc<ArcSwap<World>>,
    epoch_rx: watch::Receiver<u64>,
}

impl StoreReader {
    pub fn current(&self) -> Arc<World> { self.snap.load_full() }

    /// Receiver notified with the new epoch after every committed write.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    pub fn lookup_by_name(&self, kind: ResourceKind, env: &str, name: &str) -> Option<Record> {
        self.snap.load().lookup_by_name(kind, env, name).cloned()
    }

    pub fn lookup_objects(&self, kind: ResourceKind, env: &str) -> FxHashMap<String, Resource> {
        self.snap.load().lookup_objects(kind, env)
    }
}

/// The only path that mutates the world. Writes are serialized by a lock so
/// each one reads the latest snapshot, computes the next store and publishes it.
pub struct StoreWriter {
    snap: Arc<ArcSwap<World>>,
    epoch_tx: watch::Sender<u64>,
    epoch_rx: watch::Receiver<u64>,
    lock: Mutex<()>,
}

impl Default for StoreWriter {
    fn default() -> Self { Self::new() }
}

impl StoreWriter {
    pub fn new() -> Self {
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        Self {
            snap: Arc::new(ArcSwap::from_pointee(World::default())),
            epoch_tx,
            epoch_rx,
            lock: Mutex::new(()),
        }
    }

    pub fn reader(&self) -> StoreReader {
        StoreReader { snap: Arc::clone(&self.snap), epoch_rx: self.epoch_rx.clone() }
    }

    pub fn current(&self) -> Arc<World> { self.snap.load_full() }

    /// Reconcile one watch event into the `kind` store. Returns the new epoch.
    pub fn apply(&self, kind: ResourceKind, env: &str, event: WatchEvent) -> u64 {
        counter!("store_events_total", 1u64, "kind" => kind.plural());
        self.commit(kind, |s| apply(s, env, event, kind))
    }

    /// Fold a batch of log events into a pod record.
    pub fn append_logs(&self, env: &str, pod: &str, events: &[LogEvent]) -> u64 {
        histogram!("store_log_batch_len", events.len() as f64);
        self.commit(ResourceKind::Pod, |s| append_batch(s, env, pod, events))
    }

    pub fn set_field(&self, kind: ResourceKind, env: &str, name: &str, field: Field, value: Value) -> u64 {
        self.commit(kind, |s| s.set_field(env, name, field, value))
    }

    fn commit(&self, kind: ResourceKind, f: impl FnOnce(&Store) -> Store) -> u64 {
        let _guard = self.lock.lock();
        let cur = self.snap.load_full();
        let next_store = match cur.store(kind) {
            Some(s) => f(s),
            None => f(&Store::new(kind)),
        };
        let mut stores = cur.stores.clone();
        stores.insert(kind, Arc::new(next_store));
        let epoch = cur.epoch.saturating_add(1);
        self.snap.store(Arc::new(World { epoch, stores }));
        self.epoch_tx.send_replace(epoch);
        debug!(kind = %kind, epoch, "store: committed");
        epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commits_bump_epoch_and_publish_to_readers() {
        let w = StoreWriter::new();
        let r = w.reader();
        let rx = r.subscribe_epoch();
        let before = r.current();
        assert_eq!(w.apply(ResourceKind::Node, "prod", WatchEvent::Added(json!({"metadata": {"name": "n1"}}))), 1);
        assert_eq!(*rx.borrow(), 1);
        assert!(before.store(ResourceKind::Node).is_none(), "old snapshots are immutable");
        assert!(r.lookup_by_name(ResourceKind::Node, "prod", "n1").is_some());
        assert!(r.lookup_objects(ResourceKind::Pod, "prod").is_empty());
    }
}
