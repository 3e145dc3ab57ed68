//! Keel core types: lifecycle events, workload records, manifests.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod fields;

pub use fields::{FieldError, Fields, WireEvent};

/// Kind of a deployment-lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    Deleted,
    Requested,
    /// Anything else seen on the topic; kept so the processor can log and drop it.
    Other(String),
}

impl EventKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "CREATED" => Self::Created,
            "DELETED" => Self::Deleted,
            "REQUESTED" => Self::Requested,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Created => "CREATED",
            Self::Deleted => "DELETED",
            Self::Requested => "REQUESTED",
            Self::Other(s) => s.as_str(),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProjectType {
    Static,
    Dynamic,
}

impl ProjectType {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Static => "STATIC", Self::Dynamic => "DYNAMIC" }
    }
}

impl std::str::FromStr for ProjectType {
    type Err = FieldError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STATIC" => Ok(Self::Static),
            "DYNAMIC" => Ok(Self::Dynamic),
            other => Err(FieldError::Invalid { field: "projectType", value: other.to_string() }),
        }
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Outcome reported on the container-status topic; also the persisted workload status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusKind {
    Starting,
    Running,
    Stopped,
    Failed,
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::str::FromStr for StatusKind {
    type Err = FieldError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTING" => Ok(Self::Starting),
            "RUNNING" => Ok(Self::Running),
            "STOPPED" => Ok(Self::Stopped),
            "FAILED" => Ok(Self::Failed),
            other => Err(FieldError::Invalid { field: "status", value: other.to_string() }),
        }
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// A deployment-lifecycle event as read from the stream. Never mutated after decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub kind: EventKind,
    pub project_id: String,
    pub deployment_id: String,
    pub commit_hash: String,
    /// `None` when the producer left it empty (REQUESTED events usually do).
    pub project_type: Option<ProjectType>,
    pub request_id: String,
}

/// Kind of a project-lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectEventKind {
    Created,
    Deleted,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectEvent {
    pub kind: ProjectEventKind,
    pub project_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub kind: StatusKind,
    pub project_id: String,
    pub deployment_id: String,
    pub request_id: String,
    pub reason: Option<String>,
    /// RFC 3339
    pub timestamp: String,
}

impl StatusEvent {
    pub fn new(kind: StatusKind, project_id: &str, deployment_id: &str, request_id: &str) -> Self {
        Self {
            kind,
            project_id: project_id.to_string(),
            deployment_id: deployment_id.to_string(),
            request_id: request_id.to_string(),
            reason: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn for_event(kind: StatusKind, ev: &StreamEvent) -> Self {
        Self::new(kind, &ev.project_id, &ev.deployment_id, &ev.request_id)
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Persisted view of a running (or recently running) free-tier workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRecord {
    pub project_id: String,
    pub deployment_id: String,
    pub project_type: ProjectType,
    pub status: StatusKind,
    pub namespace: String,
    /// Unix seconds of the last request routed to the workload.
    pub last_ingressed_at: i64,
}

/// Point-in-time node memory usage; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeMemorySample {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl NodeMemorySample {
    pub fn usage_percent(&self) -> f64 {
        if self.total_bytes == 0 { return 0.0; }
        self.used_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}

/// Which container configuration a manifest is resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestKind {
    /// Build-time container: static projects build and publish their assets.
    Build,
    /// Run-time container: dynamic projects serve traffic.
    Run,
}

impl ManifestKind {
    pub fn for_project(pt: ProjectType) -> Self {
        match pt { ProjectType::Static => Self::Build, ProjectType::Dynamic => Self::Run }
    }

    pub fn as_str(&self) -> &'static str {
        match self { Self::Build => "build", Self::Run => "run" }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerManifest {
    pub image: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub container_id: String,
}

impl ContainerManifest {
    /// Listening port declared through the `PORT` environment variable.
    pub fn port(&self) -> Option<u16> {
        self.env.get("PORT").and_then(|p| p.trim().parse().ok())
    }
}

/// Latest deployment of a project as reported by the Projects service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDeployment {
    pub project_id: String,
    pub deployment_id: String,
    pub project_type: ProjectType,
    #[serde(default)]
    pub commit_hash: String,
}

pub mod prelude {
    pub use super::{
        ContainerManifest, EventKind, ManifestKind, NodeMemorySample, ProjectDeployment, ProjectEvent,
        ProjectEventKind, ProjectType, StatusEvent, StatusKind, StreamEvent, WireEvent, WorkloadRecord,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_percent_handles_zero_total() {
        assert_eq!(NodeMemorySample { used_bytes: 10, total_bytes: 0 }.usage_percent(), 0.0);
        let s = NodeMemorySample { used_bytes: 899, total_bytes: 1000 };
        assert!((s.usage_percent() - 89.9).abs() < 1e-9);
    }

    #[test]
    fn manifest_port_reads_env() {
        let mut m = ContainerManifest::default();
        assert_eq!(m.port(), None);
        m.env.insert("PORT".into(), " 3000".into());
        assert_eq!(m.port(), Some(3000));
        m.env.insert("PORT".into(), "http".into());
        assert_eq!(m.port(), None);
    }

    #[test]
    fn unknown_kind_is_preserved() {
        assert_eq!(EventKind::parse("CREATED"), EventKind::Created);
        assert_eq!(EventKind::parse("PAUSED"), EventKind::Other("PAUSED".into()));
        assert_eq!(EventKind::parse("PAUSED").as_str(), "PAUSED");
    }

    #[test]
    fn manifest_json_uses_camel_case() {
        let m: ContainerManifest = serde_json::from_str(r#"{"image":"reg/app:1","env":{"PORT":"8080"},"containerId":"c1"}"#).unwrap();
        assert_eq!(m.container_id, "c1");
        assert_eq!(m.port(), Some(8080));
    }
}
