//! kdash store: the normalized, per-environment view of every tracked resource.
//!
//! A [`Store`] holds one resource kind. It is split into one [`Partition`]
//! per environment, each keyed by resource name. Stores are persistent
//! values: every write returns a new `Store` and leaves the input untouched,
//! sharing unchanged partitions and records through `Arc`.

#![forbid(unsafe_code)]

use std::sync::Arc;

use kdash_core::{LabelSelector, LabelSet, Resource, ResourceKind, ResourceModel};
use rustc_hash::FxHashMap;
use serde_json::Value;

pub mod logs;
pub mod reconcile;
pub mod world;

pub use logs::{append_batch, LogEvent};
pub use reconcile::apply;
pub use world::{StoreReader, StoreWriter, World};

/// Supplementary fields filled in by one-shot request/response calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Spec,
    Repository,
    Service,
}

impl std::str::FromStr for Field {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "spec" => Ok(Field::Spec),
            "repository" => Ok(Field::Repository),
            "service" => Ok(Field::Service),
            other => Err(format!("unknown field: {}", other)),
        }
    }
}

/// One tracked object. Streamed and fetched data for the same name live here together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub name: String,
    pub object: Option<Resource>,
    pub spec: Option<Value>,
    pub repository: Option<Value>,
    pub service: Option<Value>,
    pub log: Option<String>,
}

impl Record {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn field(&self, field: Field) -> Option<&Value> {
        match field {
            Field::Spec => self.spec.as_ref(),
            Field::Repository => self.repository.as_ref(),
            Field::Service => self.service.as_ref(),
        }
    }

    fn set(&mut self, field: Field, value: Value) {
        match field {
            Field::Spec => self.spec = Some(value),
            Field::Repository => self.repository = Some(value),
            Field::Service => self.service = Some(value),
        }
    }
}

/// Records of one kind within one environment, keyed by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partition {
    records: FxHashMap<String, Arc<Record>>,
}

impl Partition {
    pub fn get(&self, name: &str) -> Option<&Record> {
        self.records.get(name).map(|r| r.as_ref())
    }
    pub fn len(&self) -> usize { self.records.len() }
    pub fn is_empty(&self) -> bool { self.records.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Record)> {
        self.records.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    /// Names in ascending order; the map itself carries no order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.records.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }

    fn objects_where(&self, mut keep: impl FnMut(&Resource) -> bool) -> FxHashMap<String, Resource> {
        self.records
            .iter()
            .filter_map(|(name, rec)| rec.object.as_ref().filter(|o| keep(*o)).map(|o| (name.clone(), o.clone())))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Store {
    kind: ResourceKind,
    envs: FxHashMap<String, Arc<Partition>>,
}

impl Store {
    pub fn new(kind: ResourceKind) -> Self {
        Self { kind, envs: FxHashMap::default() }
    }

    pub fn kind(&self) -> ResourceKind { self.kind }

    pub fn environments(&self) -> impl Iterator<Item = &str> {
        self.envs.keys().map(|k| k.as_str())
    }

    pub fn lookup(&self, env: &str) -> Option<&Partition> {
        self.envs.get(env).map(|p| p.as_ref())
    }

    /// Name → object for every record of `env` that has a streamed object.
    pub fn lookup_objects(&self, env: &str) -> FxHashMap<String, Resource> {
        self.lookup(env).map(|p| p.objects_where(|_| true)).unwrap_or_default()
    }

    pub fn lookup_by_name(&self, env: &str, name: &str) -> Option<&Record> {
        self.lookup(env).and_then(|p| p.get(name))
    }

    /// Objects whose labels satisfy `pred`. Derived from the partition on every
    /// call, so the result always reflects the latest write.
    pub fn lookup_by_label_predicate<P>(&self, env: &str, pred: P) -> FxHashMap<String, Resource>
    where
        P: Fn(&LabelSet<'_>) -> bool,
    {
        self.lookup(env)
            .map(|p| p.objects_where(|o| pred(&o.labels())))
            .unwrap_or_default()
    }

    pub fn lookup_by_selector(&self, env: &str, selector: &LabelSelector) -> FxHashMap<String, Resource> {
        self.lookup_by_label_predicate(env, |labels| selector.matches(labels))
    }

    /// Write a fetched supplementary field into the record for `name`,
    /// creating partition and record when missing.
    pub fn set_field(&self, env: &str, name: &str, field: Field, value: Value) -> Store {
        self.update_record(env, name, |rec| rec.set(field, value))
    }

    /// Copy-on-write edit of one partition.
    pub(crate) fn update(&self, env: &str, edit: impl FnOnce(&mut Partition)) -> Store {
        let mut next = self.clone();
        let part = next.envs.entry(env.to_string()).or_default();
        edit(Arc::make_mut(part));
        next
    }

    /// Copy-on-write edit of one record, creating it when missing.
    pub(crate) fn update_record(&self, env: &str, name: &str, edit: impl FnOnce(&mut Record)) -> Store {
        self.update(env, |p| {
            let rec = p.records.entry(name.to_string()).or_insert_with(|| Arc::new(Record::new(name)));
            edit(Arc::make_mut(rec));
        })
    }

    /// Remove `name` from `env`. Missing environment or name returns an equal store.
    pub(crate) fn remove(&self, env: &str, name: &str) -> Store {
        match self.lookup(env) {
            Some(p) if p.records.contains_key(name) => self.update(env, |p| {
                p.records.remove(name);
            }),
            _ => self.clone(),
        }
    }

    pub(crate) fn upsert_objects(&self, env: &str, objects: Vec<(String, Resource)>) -> Store {
        self.update(env, |p| {
            for (name, obj) in objects {
                let rec = p.records.entry(name.clone()).or_insert_with(|| Arc::new(Record::new(name)));
                Arc::make_mut(rec).object = Some(obj);
            }
        })
    }
}
