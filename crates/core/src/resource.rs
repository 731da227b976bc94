//! Typed resource variants.
//!
//! Every tracked object is kept as its raw JSON payload (shared behind an
//! `Arc`, never mutated) wrapped in a per-kind struct. The common
//! [`ResourceModel`] trait exposes identity and metadata; each kind adds its
//! own derived accessors over the payload.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use smallvec::SmallVec;

use crate::labels::LabelSet;
use crate::ResourceKind;

fn str_at<'a>(v: &'a Value, ptr: &str) -> Option<&'a str> {
    v.pointer(ptr).and_then(|x| x.as_str())
}

fn i64_at(v: &Value, ptr: &str) -> Option<i64> {
    v.pointer(ptr).and_then(|x| x.as_i64())
}

fn bool_at(v: &Value, ptr: &str) -> bool {
    v.pointer(ptr).and_then(|x| x.as_bool()).unwrap_or(false)
}

/// True when the conditions array at `ptr` holds `type == ty` with `status == "True"`.
fn condition_true(v: &Value, ptr: &str, ty: &str) -> bool {
    v.pointer(ptr)
        .and_then(|c| c.as_array())
        .map(|conds| {
            conds.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some(ty)
                    && c.get("status").and_then(|s| s.as_str()) == Some("True")
            })
        })
        .unwrap_or(false)
}

/// Name declared by a raw payload: `metadata.name`, else a top-level `name`.
pub fn object_name(raw: &Value) -> Option<&str> {
    str_at(raw, "/metadata/name").or_else(|| raw.get("name").and_then(|n| n.as_str()))
}

/// Capability shared by every resource variant.
pub trait ResourceModel {
    fn raw(&self) -> &Value;

    fn name(&self) -> Option<&str> {
        object_name(self.raw())
    }

    fn namespace(&self) -> Option<&str> {
        str_at(self.raw(), "/metadata/namespace")
    }

    fn uid(&self) -> Option<&str> {
        str_at(self.raw(), "/metadata/uid")
    }

    fn labels(&self) -> LabelSet<'_> {
        LabelSet::from_value(self.raw().pointer("/metadata/labels"))
    }

    fn annotations(&self) -> LabelSet<'_> {
        LabelSet::from_value(self.raw().pointer("/metadata/annotations"))
    }

    fn creation_timestamp(&self) -> Option<DateTime<FixedOffset>> {
        str_at(self.raw(), "/metadata/creationTimestamp")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    }
}

macro_rules! typed_resource {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, PartialEq)]
            pub struct $name {
                raw: Arc<Value>,
            }

            impl $name {
                pub fn new(raw: Value) -> Self {
                    Self { raw: Arc::new(raw) }
                }
            }

            impl ResourceModel for $name {
                fn raw(&self) -> &Value {
                    &self.raw
                }
            }
        )+
    };
}

typed_resource!(
    /// apps/v1 Deployment.
    Deployment,
    /// batch/v1 Job.
    Job,
    /// v1 Pod.
    Pod,
    /// v1 Node.
    Node,
    /// v1 ConfigMap.
    ConfigMap,
    /// A single execution of a job.
    JobRun,
    /// apps/v1 ReplicaSet.
    ReplicaSet,
    /// A packaged application release installed into an environment.
    Release,
);

fn container_images<'a>(raw: &'a Value, ptr: &str) -> SmallVec<[&'a str; 4]> {
    raw.pointer(ptr)
        .and_then(|c| c.as_array())
        .map(|cs| cs.iter().filter_map(|c| c.get("image").and_then(|i| i.as_str())).collect())
        .unwrap_or_default()
}

impl Deployment {
    /// Desired replicas (`spec.replicas`, defaulting to 1 like the API server).
    pub fn replicas(&self) -> i64 {
        i64_at(&self.raw, "/spec/replicas").unwrap_or(1)
    }
    pub fn ready_replicas(&self) -> i64 {
        i64_at(&self.raw, "/status/readyReplicas").unwrap_or(0)
    }
    pub fn updated_replicas(&self) -> i64 {
        i64_at(&self.raw, "/status/updatedReplicas").unwrap_or(0)
    }
    pub fn available_replicas(&self) -> i64 {
        i64_at(&self.raw, "/status/availableReplicas").unwrap_or(0)
    }
    pub fn is_paused(&self) -> bool {
        bool_at(&self.raw, "/spec/paused")
    }
    pub fn images(&self) -> SmallVec<[&str; 4]> {
        container_images(&self.raw, "/spec/template/spec/containers")
    }
    /// Controller has observed the latest generation and all replicas are ready.
    pub fn is_rolled_out(&self) -> bool {
        let generation = i64_at(&self.raw, "/metadata/generation").unwrap_or(0);
        let observed = i64_at(&self.raw, "/status/observedGeneration").unwrap_or(0);
        observed >= generation && self.ready_replicas() >= self.replicas()
    }
}

impl Job {
    pub fn completions(&self) -> i64 {
        i64_at(&self.raw, "/spec/completions").unwrap_or(1)
    }
    pub fn succeeded(&self) -> i64 {
        i64_at(&self.raw, "/status/succeeded").unwrap_or(0)
    }
    pub fn failed(&self) -> i64 {
        i64_at(&self.raw, "/status/failed").unwrap_or(0)
    }
    pub fn active(&self) -> i64 {
        i64_at(&self.raw, "/status/active").unwrap_or(0)
    }
    pub fn is_complete(&self) -> bool {
        condition_true(&self.raw, "/status/conditions", "Complete")
    }
    pub fn is_failed(&self) -> bool {
        condition_true(&self.raw, "/status/conditions", "Failed")
    }
}

impl Pod {
    pub fn phase(&self) -> Option<&str> {
        str_at(&self.raw, "/status/phase")
    }
    pub fn node_name(&self) -> Option<&str> {
        str_at(&self.raw, "/spec/nodeName")
    }
    pub fn container_names(&self) -> SmallVec<[&str; 4]> {
        self.raw
            .pointer("/spec/containers")
            .and_then(|c| c.as_array())
            .map(|cs| cs.iter().filter_map(|c| c.get("name").and_then(|n| n.as_str())).collect())
            .unwrap_or_default()
    }
    pub fn images(&self) -> SmallVec<[&str; 4]> {
        container_images(&self.raw, "/spec/containers")
    }
    /// Sum of restarts across container statuses.
    pub fn restart_count(&self) -> i64 {
        self.raw
            .pointer("/status/containerStatuses")
            .and_then(|c| c.as_array())
            .map(|cs| cs.iter().filter_map(|c| c.get("restartCount").and_then(|r| r.as_i64())).sum())
            .unwrap_or(0)
    }
    pub fn is_ready(&self) -> bool {
        condition_true(&self.raw, "/status/conditions", "Ready")
    }
}

impl Node {
    pub fn is_ready(&self) -> bool {
        condition_true(&self.raw, "/status/conditions", "Ready")
    }
    pub fn is_unschedulable(&self) -> bool {
        bool_at(&self.raw, "/spec/unschedulable")
    }
    /// Capacity quantity for a resource name such as `cpu` or `memory`.
    pub fn capacity(&self, resource: &str) -> Option<&str> {
        self.raw
            .pointer("/status/capacity")
            .and_then(|c| c.get(resource))
            .and_then(|q| q.as_str())
    }
    pub fn kubelet_version(&self) -> Option<&str> {
        str_at(&self.raw, "/status/nodeInfo/kubeletVersion")
    }
}

impl ConfigMap {
    pub fn data_keys(&self) -> Vec<&str> {
        self.raw
            .get("data")
            .and_then(|d| d.as_object())
            .map(|m| m.keys().map(|k| k.as_str()).collect())
            .unwrap_or_default()
    }
    pub fn get(&self, key: &str) -> Option<&str> {
        self.raw.get("data").and_then(|d| d.get(key)).and_then(|v| v.as_str())
    }
}

impl JobRun {
    /// Owning job: `spec.jobName`, else the `job-name` label.
    pub fn job_name(&self) -> Option<&str> {
        str_at(&self.raw, "/spec/jobName").or_else(|| self.labels().get("job-name"))
    }
    pub fn status(&self) -> Option<&str> {
        str_at(&self.raw, "/status/phase")
    }
}

impl ReplicaSet {
    /// Name of the owning Deployment, if any.
    pub fn owner_deployment(&self) -> Option<&str> {
        self.raw
            .pointer("/metadata/ownerReferences")
            .and_then(|o| o.as_array())
            .and_then(|refs| {
                refs.iter()
                    .find(|r| r.get("kind").and_then(|k| k.as_str()) == Some("Deployment"))
                    .and_then(|r| r.get("name").and_then(|n| n.as_str()))
            })
    }
    pub fn replicas(&self) -> i64 {
        i64_at(&self.raw, "/spec/replicas").unwrap_or(1)
    }
    pub fn ready_replicas(&self) -> i64 {
        i64_at(&self.raw, "/status/readyReplicas").unwrap_or(0)
    }
}

impl Release {
    pub fn chart(&self) -> Option<&str> {
        str_at(&self.raw, "/chart/metadata/name").or_else(|| str_at(&self.raw, "/chart"))
    }
    pub fn chart_version(&self) -> Option<&str> {
        str_at(&self.raw, "/chart/metadata/version")
    }
    pub fn app_version(&self) -> Option<&str> {
        str_at(&self.raw, "/chart/metadata/appVersion")
    }
    pub fn status(&self) -> Option<&str> {
        str_at(&self.raw, "/info/status")
    }
    pub fn revision(&self) -> Option<i64> {
        i64_at(&self.raw, "/version")
    }
}

/// Closed set of typed resources.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    Deployment(Deployment),
    Job(Job),
    Pod(Pod),
    Node(Node),
    ConfigMap(ConfigMap),
    JobRun(JobRun),
    ReplicaSet(ReplicaSet),
    Release(Release),
}

impl Resource {
    pub fn new(kind: ResourceKind, raw: Value) -> Self {
        match kind {
            ResourceKind::Deployment => Resource::Deployment(Deployment::new(raw)),
            ResourceKind::Job => Resource::Job(Job::new(raw)),
            ResourceKind::Pod => Resource::Pod(Pod::new(raw)),
            ResourceKind::Node => Resource::Node(Node::new(raw)),
            ResourceKind::ConfigMap => Resource::ConfigMap(ConfigMap::new(raw)),
            ResourceKind::JobRun => Resource::JobRun(JobRun::new(raw)),
            ResourceKind::ReplicaSet => Resource::ReplicaSet(ReplicaSet::new(raw)),
            ResourceKind::Release => Resource::Release(Release::new(raw)),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Deployment(_) => ResourceKind::Deployment,
            Resource::Job(_) => ResourceKind::Job,
            Resource::Pod(_) => ResourceKind::Pod,
            Resource::Node(_) => ResourceKind::Node,
            Resource::ConfigMap(_) => ResourceKind::ConfigMap,
            Resource::JobRun(_) => ResourceKind::JobRun,
            Resource::ReplicaSet(_) => ResourceKind::ReplicaSet,
            Resource::Release(_) => ResourceKind::Release,
        }
    }

    pub fn as_deployment(&self) -> Option<&Deployment> {
        match self { Resource::Deployment(d) => Some(d), _ => None }
    }
    pub fn as_pod(&self) -> Option<&Pod> {
        match self { Resource::Pod(p) => Some(p), _ => None }
    }
    pub fn as_job(&self) -> Option<&Job> {
        match self { Resource::Job(j) => Some(j), _ => None }
    }
    pub fn as_node(&self) -> Option<&Node> {
        match self { Resource::Node(n) => Some(n), _ => None }
    }
    pub fn as_release(&self) -> Option<&Release> {
        match self { Resource::Release(r) => Some(r), _ => None }
    }
}

impl ResourceModel for Resource {
    fn raw(&self) -> &Value {
        match self {
            Resource::Deployment(r) => r.raw(),
            Resource::Job(r) => r.raw(),
            Resource::Pod(r) => r.raw(),
            Resource::Node(r) => r.raw(),
            Resource::ConfigMap(r) => r.raw(),
            Resource::JobRun(r) => r.raw(),
            Resource::ReplicaSet(r) => r.raw(),
            Resource::Release(r) => r.raw(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn name_falls_back_to_top_level_field() {
        let r = ResourceKind::Release.wrap(json!({ "name": "web", "info": { "status": "deployed" } }));
        assert_eq!(r.name(), Some("web"));
        assert_eq!(r.as_release().and_then(|r| r.status()), Some("deployed"));
    }

    #[test]
    fn deployment_accessors_read_spec_and_status() {
        let r = ResourceKind::Deployment.wrap(json!({
            "metadata": { "name": "api", "generation": 3, "labels": { "app": "api" } },
            "spec": { "replicas": 2, "template": { "spec": { "containers": [
                { "name": "api", "image": "registry/api:1.2" }
            ] } } },
            "status": { "readyReplicas": 2, "observedGeneration": 3 }
        }));
        let d = r.as_deployment().unwrap();
        assert_eq!(d.replicas(), 2);
        assert!(d.is_rolled_out());
        assert!(!d.is_paused());
        assert_eq!(d.images().as_slice(), &["registry/api:1.2"]);
        assert_eq!(r.labels().get("app"), Some("api"));
    }

    #[test]
    fn pod_restart_count_sums_containers() {
        let r = ResourceKind::Pod.wrap(json!({
            "metadata": { "name": "p1" },
            "status": {
                "phase": "Running",
                "containerStatuses": [{ "restartCount": 2 }, { "restartCount": 3 }],
                "conditions": [{ "type": "Ready", "status": "True" }]
            }
        }));
        let p = r.as_pod().unwrap();
        assert_eq!(p.restart_count(), 5);
        assert!(p.is_ready());
        assert_eq!(p.phase(), Some("Running"));
    }

    #[test]
    fn pod_images_borrow_from_the_payload() {
        let r = ResourceKind::Pod.wrap(json!({
            "metadata": { "name": "p2" },
            "spec": { "containers": [{ "name": "app", "image": "app:1" }, { "name": "side" }, { "image": "proxy:2" }] }
        }));
        let images = r.as_pod().unwrap().images();
        assert_eq!(images.as_slice(), &["app:1", "proxy:2"]);
        let empty = ResourceKind::Pod.wrap(json!({ "metadata": { "name": "p3" } }));
        assert!(empty.as_pod().unwrap().images().is_empty());
    }

    #[test]
    fn replica_set_owner_is_deployment_reference() {
        let r = ResourceKind::ReplicaSet.wrap(json!({
            "metadata": { "name": "api-7d9", "ownerReferences": [{ "kind": "Deployment", "name": "api" }] }
        }));
        match &r {
            Resource::ReplicaSet(rs) => assert_eq!(rs.owner_deployment(), Some("api")),
            other => panic!("unexpected variant {:?}", other.kind()),
        }
    }
}
