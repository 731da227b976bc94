#![forbid(unsafe_code)]

use kdash_core::{ResourceKind, WatchEvent};
use kdash_store::{append_batch, apply, Field, LogEvent, Store};
use serde_json::json;

fn log_of(s: &Store, env: &str, pod: &str) -> Option<String> {
    s.lookup_by_name(env, pod).and_then(|r| r.log.clone())
}

#[test]
fn appended_text_goes_first() {
    let s = Store::new(ResourceKind::Pod);
    let s = append_batch(&s, "prod", "p1", &[LogEvent::Start("A".into())]);
    let s = append_batch(&s, "prod", "p1", &[LogEvent::Append("B".into())]);
    assert_eq!(log_of(&s, "prod", "p1").as_deref(), Some("B\nA"));
}

#[test]
fn batch_folds_in_order_and_start_resets() {
    let s = Store::new(ResourceKind::Pod);
    let s = append_batch(
        &s,
        "prod",
        "p1",
        &[
            LogEvent::Start("A".into()),
            LogEvent::Append("B".into()),
            LogEvent::Append("C".into()),
        ],
    );
    assert_eq!(log_of(&s, "prod", "p1").as_deref(), Some("C\nB\nA"));
    let s = append_batch(&s, "prod", "p1", &[LogEvent::Start("fresh".into()), LogEvent::Append("x".into())]);
    assert_eq!(log_of(&s, "prod", "p1").as_deref(), Some("x\nfresh"));
}

#[test]
fn logs_live_beside_the_streamed_pod() {
    let s = Store::new(ResourceKind::Pod);
    let s = apply(&s, "prod", WatchEvent::Added(json!({"metadata": {"name": "p1"}})), ResourceKind::Pod);
    let s = append_batch(&s, "prod", "p1", &[LogEvent::Append("boot".into())]);
    let s = s.set_field("prod", "p1", Field::Service, json!({"port": 80}));
    let s = apply(&s, "prod", WatchEvent::Modified(json!({"metadata": {"name": "p1"}, "v": 2})), ResourceKind::Pod);

    let rec = s.lookup_by_name("prod", "p1").unwrap();
    assert_eq!(rec.log.as_deref(), Some("boot"));
    assert_eq!(rec.service, Some(json!({"port": 80})));
    assert!(rec.object.is_some());
}
