//! Log aggregation for streamed pod output.
//!
//! Text is kept most-recent-first: each appended payload goes in front of the
//! accumulated text, separated by a newline.

use kdash_core::WatchEvent;
use serde_json::Value;

use crate::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// Replace the stored text.
    Start(String),
    /// Prepend to the stored text.
    Append(String),
}

fn payload_text(v: Value) -> String {
    match v {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

impl LogEvent {
    /// `Init` starts the log, `Added`/`Modified` append, `Deleted` carries no text.
    pub fn from_watch(ev: WatchEvent) -> Option<Self> {
        match ev {
            WatchEvent::Init(list) => {
                Some(LogEvent::Start(list.into_iter().map(payload_text).collect::<Vec<_>>().join("\n")))
            }
            WatchEvent::Added(v) | WatchEvent::Modified(v) => Some(LogEvent::Append(payload_text(v))),
            WatchEvent::Deleted(_) => None,
        }
    }
}

/// Fold a batch of log events into the `log` field of pod `pod` in `env`.
pub fn append_batch(store: &Store, env: &str, pod: &str, events: &[LogEvent]) -> Store {
    if events.is_empty() {
        return store.clone();
    }
    let mut text = store.lookup_by_name(env, pod).and_then(|r| r.log.clone());
    for ev in events {
        text = Some(match (ev, text) {
            (LogEvent::Start(t), _) => t.clone(),
            (LogEvent::Append(t), Some(prev)) => format!("{}\n{}", t, prev),
            (LogEvent::Append(t), None) => t.clone(),
        });
    }
    store.update_record(env, pod, |rec| rec.log = text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdash_core::ResourceKind;
    use serde_json::json;

    #[test]
    fn init_lines_join_into_start_text() {
        let ev = LogEvent::from_watch(WatchEvent::Init(vec![json!("a"), json!("b")]));
        assert_eq!(ev, Some(LogEvent::Start("a\nb".into())));
        assert_eq!(LogEvent::from_watch(WatchEvent::Added(json!({"n": 1}))), Some(LogEvent::Append(r#"{"n":1}"#.into())));
        assert_eq!(LogEvent::from_watch(WatchEvent::Deleted(json!("x"))), None);
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let s = Store::new(ResourceKind::Pod);
        assert_eq!(append_batch(&s, "prod", "p1", &[]), s);
    }
}
