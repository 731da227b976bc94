//! Timer-armed buffers used by the registry pumps.
//!
//! Both are plain state: the owning task reads `deadline()`, sleeps until it
//! and then calls the flush method. Every push re-arms the deadline, so a
//! flush happens only after a full quiet window.

use std::time::Duration;

use kdash_core::WatchEvent;
use serde_json::Value;
use tokio::time::Instant;

/// Ordered buffer flushed after `window` without new items.
#[derive(Debug)]
pub struct Debounce<T> {
    items: Vec<T>,
    deadline: Option<Instant>,
    window: Duration,
}

impl<T> Debounce<T> {
    pub fn new(window: Duration) -> Self {
        Self { items: Vec::new(), deadline: None, window }
    }

    pub fn push(&mut self, item: T, now: Instant) {
        self.items.push(item);
        self.deadline = Some(now + self.window);
    }

    pub fn deadline(&self) -> Option<Instant> { self.deadline }
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// Drain the buffer and disarm the timer.
    pub fn take(&mut self) -> Vec<T> {
        self.deadline = None;
        std::mem::take(&mut self.items)
    }
}

/// Lifecycle of a resource stream's initial snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No `Init` seen yet; objects are collected into the initial buffer.
    Buffering,
    /// The initial snapshot was emitted; nothing forwarded since.
    Flushed,
    /// Events pass straight through.
    Streaming,
}

/// Coalesces a pre-`Init` burst into a single synthetic `Init`.
#[derive(Debug)]
pub struct InitGate {
    phase: Phase,
    initial: Debounce<Value>,
}

impl InitGate {
    pub fn new(window: Duration) -> Self {
        Self { phase: Phase::Buffering, initial: Debounce::new(window) }
    }

    pub fn phase(&self) -> Phase { self.phase }

    pub fn buffered(&self) -> usize { self.initial.len() }

    /// Pending flush time while buffering.
    pub fn deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Buffering => self.initial.deadline(),
            Phase::Flushed | Phase::Streaming => None,
        }
    }

    /// Feed one event. Returns the event to apply now, if any.
    pub fn offer(&mut self, ev: WatchEvent, now: Instant) -> Option<WatchEvent> {
        match self.phase {
            Phase::Buffering => match ev {
                WatchEvent::Init(list) => {
                    let mut items = self.initial.take();
                    items.extend(list);
                    self.phase = Phase::Flushed;
                    Some(WatchEvent::Init(items))
                }
                // Whatever the type, only the object is kept for the snapshot.
                WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => {
                    self.initial.push(o, now);
                    None
                }
            },
            Phase::Flushed => {
                self.phase = Phase::Streaming;
                Some(ev)
            }
            Phase::Streaming => Some(ev),
        }
    }

    /// Timer fired: emit the buffered objects as one `Init`.
    pub fn flush(&mut self) -> Option<WatchEvent> {
        if self.phase != Phase::Buffering || self.initial.is_empty() {
            return None;
        }
        self.phase = Phase::Flushed;
        Some(WatchEvent::Init(self.initial.take()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const W: Duration = Duration::from_millis(200);

    fn obj(n: &str) -> Value {
        json!({ "metadata": { "name": n } })
    }

    #[test]
    fn burst_collapses_into_one_init() {
        let t0 = Instant::now();
        let mut g = InitGate::new(W);
        for (i, n) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            let now = t0 + Duration::from_millis(30 * i as u64);
            assert_eq!(g.offer(WatchEvent::Added(obj(n)), now), None);
            assert_eq!(g.deadline(), Some(now + W), "each push re-arms the window");
        }
        assert_eq!(g.buffered(), 5);
        let init = g.flush().unwrap();
        assert!(matches!(&init, WatchEvent::Init(list) if list.len() == 5));
        assert_eq!(g.phase(), Phase::Flushed);
        assert_eq!(g.deadline(), None);
        assert_eq!(g.flush(), None);

        let ev = WatchEvent::Modified(obj("a"));
        assert_eq!(g.offer(ev.clone(), t0), Some(ev));
        assert_eq!(g.phase(), Phase::Streaming);
    }

    #[test]
    fn real_init_passes_through_with_buffered_items_first() {
        let mut g = InitGate::new(W);
        let now = Instant::now();
        g.offer(WatchEvent::Added(obj("early")), now);
        let out = g.offer(WatchEvent::Init(vec![obj("x")]), now).unwrap();
        assert_eq!(out, WatchEvent::Init(vec![obj("early"), obj("x")]));
        assert_eq!(g.phase(), Phase::Flushed);
        assert_eq!(g.flush(), None);
    }

    #[test]
    fn flush_without_items_keeps_buffering() {
        let mut g = InitGate::new(W);
        assert_eq!(g.flush(), None);
        assert_eq!(g.phase(), Phase::Buffering);
    }

    #[test]
    fn debounce_take_disarms() {
        let mut d = Debounce::new(W);
        let now = Instant::now();
        d.push(1, now);
        d.push(2, now);
        assert_eq!(d.take(), vec![1, 2]);
        assert_eq!(d.deadline(), None);
        assert!(d.is_empty());
    }
}
