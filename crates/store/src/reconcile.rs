//! Event reconciler: folds one watch event into a store.

use kdash_core::{resource::object_name, Resource, ResourceKind, WatchEvent};
use tracing::{debug, warn};

use crate::Store;

fn named(kind: ResourceKind, raw: serde_json::Value) -> Option<(String, Resource)> {
    match object_name(&raw).map(str::to_string) {
        Some(name) => Some((name, kind.wrap(raw))),
        None => {
            warn!(kind = %kind, "reconcile: skipping object without a name");
            None
        }
    }
}

/// Apply `event` to the `env` partition of `store`, wrapping payloads with `kind`.
///
/// `Init` and `Added`/`Modified` upsert by name and replace the streamed
/// object wholesale; supplementary fields and logs on the record are kept.
/// `Init` never removes records missing from its list. `Deleted` removes the
/// name and is a no-op when the environment or name is unknown.
pub fn apply(store: &Store, env: &str, event: WatchEvent, kind: ResourceKind) -> Store {
    match event {
        WatchEvent::Init(list) => {
            let objects: Vec<_> = list.into_iter().filter_map(|raw| named(kind, raw)).collect();
            debug!(kind = %kind, env = %env, items = objects.len(), "reconcile: init");
            store.upsert_objects(env, objects)
        }
        WatchEvent::Added(raw) | WatchEvent::Modified(raw) => match named(kind, raw) {
            Some((name, obj)) => store.update_record(env, &name, |rec| rec.object = Some(obj)),
            None => store.clone(),
        },
        WatchEvent::Deleted(raw) => match object_name(&raw) {
            Some(name) => store.remove(env, name),
            None => {
                warn!(kind = %kind, env = %env, "reconcile: delete without a name");
                store.clone()
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(name: &str) -> serde_json::Value {
        json!({ "metadata": { "name": name } })
    }

    #[test]
    fn init_keeps_records_missing_from_the_snapshot() {
        let s = Store::new(ResourceKind::Job);
        let s = apply(&s, "prod", WatchEvent::Added(obj("stale")), ResourceKind::Job);
        let s = apply(&s, "prod", WatchEvent::Init(vec![obj("a")]), ResourceKind::Job);
        let mut names = s.lookup("prod").unwrap().names();
        names.sort();
        assert_eq!(names, vec!["a", "stale"]);
    }

    #[test]
    fn unnamed_objects_are_ignored() {
        let s = Store::new(ResourceKind::Job);
        let s2 = apply(&s, "prod", WatchEvent::Added(json!({ "spec": {} })), ResourceKind::Job);
        assert_eq!(s, s2);
        let s3 = apply(&s, "prod", WatchEvent::Init(vec![json!({}), obj("x")]), ResourceKind::Job);
        assert_eq!(s3.lookup("prod").unwrap().len(), 1);
    }
}
