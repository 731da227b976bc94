#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use kdash_core::WatchEvent;
use kdash_transport::{open, MemoryConnector, TransportHandle};
use serde_json::json;

const URL: &str = "ws://dash.local/api/watch/pods?environment=prod";

fn start(conn: &Arc<MemoryConnector>) -> (TransportHandle, Arc<Mutex<Vec<WatchEvent>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handle = open(conn.clone(), URL, Duration::from_secs(5), move |ev| sink.lock().unwrap().push(ev));
    (handle, seen)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn forwards_events_and_drops_malformed_frames() {
    let conn = MemoryConnector::new();
    let (_h, seen) = start(&conn);
    settle().await;

    assert!(conn.push_event("pods", &WatchEvent::Added(json!({"metadata": {"name": "p1"}}))));
    assert!(conn.push("pods", "{not json"));
    assert!(conn.push("pods", r#"{"type":"ADDED"}"#));
    assert!(conn.push("pods", r#"{"type":"MODIFIED","object":{"metadata":{"name":"p1"},"v":2}}"#));
    settle().await;

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].name(), Some("p1"));
    assert!(matches!(&seen[1], WatchEvent::Modified(o) if o["v"] == 2));
    assert_eq!(conn.opened(), 1, "malformed frames must not end the connection");
}

#[tokio::test(start_paused = true)]
async fn reconnects_after_fixed_delay_on_abnormal_close() {
    let conn = MemoryConnector::new();
    let (h, seen) = start(&conn);
    settle().await;
    assert_eq!(conn.opened(), 1);

    assert!(conn.disconnect("pods"));
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(conn.opened(), 1, "no reconnect before the delay elapses");
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(conn.opened(), 2);
    assert_eq!(conn.urls(), vec![URL.to_string(), URL.to_string()]);

    // Same callback after reconnect.
    assert!(conn.push_event("pods", &WatchEvent::Deleted(json!({"metadata": {"name": "p1"}}))));
    settle().await;
    assert_eq!(seen.lock().unwrap().len(), 1);

    // A read error counts as abnormal too.
    assert!(conn.fail("pods", "reset by peer"));
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(conn.opened(), 3);
    assert!(!h.is_closed());
}

#[tokio::test(start_paused = true)]
async fn close_suppresses_reconnect() {
    let conn = MemoryConnector::new();
    let (h, _seen) = start(&conn);
    settle().await;

    h.close();
    settle().await;
    assert!(h.is_closed());
    assert!(h.is_finished());
    assert_eq!(conn.live(), 0);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(conn.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn close_during_reconnect_delay_stops_the_loop() {
    let conn = MemoryConnector::new();
    let (h, _seen) = start(&conn);
    settle().await;
    assert!(conn.disconnect("pods"));
    tokio::time::sleep(Duration::from_secs(2)).await;

    h.close();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(conn.opened(), 1);
    assert!(h.is_finished());
}

#[tokio::test(start_paused = true)]
async fn closed_frame_ends_stream_without_forwarding() {
    let conn = MemoryConnector::new();
    let (h, seen) = start(&conn);
    settle().await;

    assert!(conn.push("pods", r#"{"type":"CLOSED"}"#));
    settle().await;
    assert!(seen.lock().unwrap().is_empty());
    assert!(h.is_closed());
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(conn.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_connects_retry_without_cap() {
    let conn = MemoryConnector::new();
    conn.set_refuse(true);
    let (_h, _seen) = start(&conn);

    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(conn.attempts(), 4);
    assert_eq!(conn.opened(), 0);

    conn.set_refuse(false);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(conn.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_handle_closes_the_connection() {
    let conn = MemoryConnector::new();
    let (h, _seen) = start(&conn);
    settle().await;
    assert_eq!(conn.live(), 1);

    drop(h);
    settle().await;
    assert_eq!(conn.live(), 0);
}
