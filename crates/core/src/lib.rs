//! kdash core types: resource kinds, typed resource wrappers, watch events
//! and the wire codec shared by the transport and the store.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod labels;
pub mod resource;
pub mod wire;

pub use labels::{LabelSelector, LabelSet, SelectorParseError};
pub use resource::{
    ConfigMap, Deployment, Job, JobRun, Node, Pod, Release, ReplicaSet, Resource, ResourceModel,
};
pub use wire::{decode_frame, DecodeError, Frame, FrameType, WatchEvent, WireFrame};

pub mod prelude {
    pub use super::{
        decode_frame, Frame, LabelSelector, LabelSet, Resource, ResourceKind, ResourceModel,
        WatchEvent,
    };
}

/// Category of tracked object. Each kind owns one store partition per environment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Deployment,
    Job,
    Pod,
    Node,
    ConfigMap,
    JobRun,
    ReplicaSet,
    Release,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 8] = [
        ResourceKind::Deployment,
        ResourceKind::Job,
        ResourceKind::Pod,
        ResourceKind::Node,
        ResourceKind::ConfigMap,
        ResourceKind::JobRun,
        ResourceKind::ReplicaSet,
        ResourceKind::Release,
    ];

    /// Plural path segment used by the streaming endpoint.
    pub fn plural(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "deployments",
            ResourceKind::Job => "jobs",
            ResourceKind::Pod => "pods",
            ResourceKind::Node => "nodes",
            ResourceKind::ConfigMap => "configmaps",
            ResourceKind::JobRun => "jobruns",
            ResourceKind::ReplicaSet => "replicasets",
            ResourceKind::Release => "releases",
        }
    }

    /// Watch endpoint path for this kind, e.g. `/api/watch/pods`.
    pub fn watch_path(&self) -> String {
        format!("/api/watch/{}", self.plural())
    }

    /// Construct the typed resource variant for a raw payload of this kind.
    pub fn wrap(&self, raw: serde_json::Value) -> Resource {
        Resource::new(*self, raw)
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.plural())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown resource kind: {0}")]
pub struct UnknownKind(pub String);

impl std::str::FromStr for ResourceKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let key = lower.replace(['-', '_'], "");
        ResourceKind::ALL
            .iter()
            .copied()
            .find(|k| {
                let plural = k.plural();
                key == plural || key == plural.trim_end_matches('s')
            })
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// Path of the pod log stream endpoint.
pub const POD_LOG_PATH: &str = "/api/watch/pods/log";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_parse_from_singular_and_plural() {
        assert_eq!("pods".parse::<ResourceKind>().unwrap(), ResourceKind::Pod);
        assert_eq!("Deployment".parse::<ResourceKind>().unwrap(), ResourceKind::Deployment);
        assert_eq!("config-map".parse::<ResourceKind>().unwrap(), ResourceKind::ConfigMap);
        assert_eq!("job_runs".parse::<ResourceKind>().unwrap(), ResourceKind::JobRun);
        assert!("services".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn watch_path_uses_plural() {
        assert_eq!(ResourceKind::ReplicaSet.watch_path(), "/api/watch/replicasets");
    }
}
