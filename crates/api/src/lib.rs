//! Keel Projects service client.
//!
//! The orchestrator asks the Projects service two things: which deployment
//! is the latest for a project, and which container to run for a deployment.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use keel_core::{ContainerManifest, ManifestKind, ProjectDeployment, ProjectType};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[async_trait]
pub trait ProjectsApi: Send + Sync {
    /// Latest deployment of the project, `None` when it has never been deployed.
    async fn latest_deployment(&self, project_id: &str) -> Result<Option<ProjectDeployment>>;
    async fn container_manifest(&self, project_id: &str, deployment_id: &str, kind: ManifestKind) -> Result<ContainerManifest>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestDeployment {
    pub id: String,
    #[serde(default)]
    pub commit_hash: String,
}

/// Body of `GET /projects/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    pub id: String,
    pub application_type: ProjectType,
    #[serde(default)]
    pub latest_deployment: Option<LatestDeployment>,
}

impl ProjectInfo {
    pub fn into_latest(self) -> Option<ProjectDeployment> {
        let ProjectInfo { id, application_type, latest_deployment } = self;
        latest_deployment.map(|d| ProjectDeployment {
            project_id: id,
            deployment_id: d.id,
            project_type: application_type,
            commit_hash: d.commit_hash,
        })
    }
}

/// Projects service over HTTP/JSON.
#[derive(Clone)]
pub struct HttpProjects {
    base_url: String,
    client: reqwest::Client,
}

impl HttpProjects {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .context("building projects http client")?;
        Ok(Self { base_url: base_url.into(), client })
    }

    fn project_url(&self, project_id: &str) -> String {
        format!("{}/projects/{}", self.base_url.trim_end_matches('/'), project_id)
    }

    fn manifest_url(&self, project_id: &str, deployment_id: &str, kind: ManifestKind) -> String {
        format!("{}/deployments/{}/manifest?config={}", self.project_url(project_id), deployment_id, kind.as_str())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str, what: &str) -> Result<T> {
        let started = Instant::now();
        let response = self.client.get(url).send().await.with_context(|| format!("{} request failed", what))?;
        histogram!("projects_request_ms", started.elapsed().as_secs_f64() * 1000.0);
        let status = response.status();
        if !status.is_success() {
            counter!("projects_request_errors_total", 1u64);
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("{} failed ({}): {}", what, status, body.trim()));
        }
        response.json::<T>().await.with_context(|| format!("invalid {} response", what))
    }
}

#[async_trait]
impl ProjectsApi for HttpProjects {
    async fn latest_deployment(&self, project_id: &str) -> Result<Option<ProjectDeployment>> {
        let info: ProjectInfo = self.get_json(&self.project_url(project_id), "project lookup").await?;
        debug!(project = %project_id, has_deployment = info.latest_deployment.is_some(), "project fetched");
        Ok(info.into_latest())
    }

    async fn container_manifest(&self, project_id: &str, deployment_id: &str, kind: ManifestKind) -> Result<ContainerManifest> {
        let url = self.manifest_url(project_id, deployment_id, kind);
        self.get_json(&url, "manifest lookup").await
    }
}

/// In-process Projects service for tests and dry runs.
#[derive(Default)]
pub struct MemoryProjects {
    projects: Mutex<HashMap<String, ProjectInfo>>,
    manifests: Mutex<HashMap<(String, String, ManifestKind), ContainerManifest>>,
}

impl MemoryProjects {
    pub fn new() -> Self { Self::default() }

    pub fn put_project(&self, info: ProjectInfo) {
        if let Ok(mut p) = self.projects.lock() {
            p.insert(info.id.clone(), info);
        }
    }

    pub fn put_manifest(&self, project_id: &str, deployment_id: &str, kind: ManifestKind, m: ContainerManifest) {
        if let Ok(mut ms) = self.manifests.lock() {
            ms.insert((project_id.to_string(), deployment_id.to_string(), kind), m);
        }
    }
}

#[async_trait]
impl ProjectsApi for MemoryProjects {
    async fn latest_deployment(&self, project_id: &str) -> Result<Option<ProjectDeployment>> {
        let projects = self.projects.lock().map_err(|_| anyhow!("projects lock poisoned"))?;
        let info = projects.get(project_id).cloned().ok_or_else(|| anyhow!("project {} not found", project_id))?;
        Ok(info.into_latest())
    }

    async fn container_manifest(&self, project_id: &str, deployment_id: &str, kind: ManifestKind) -> Result<ContainerManifest> {
        let ms = self.manifests.lock().map_err(|_| anyhow!("manifests lock poisoned"))?;
        ms.get(&(project_id.to_string(), deployment_id.to_string(), kind))
            .cloned()
            .ok_or_else(|| anyhow!("no {} manifest for {}/{}", kind.as_str(), project_id, deployment_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls() {
        let c = HttpProjects::new("http://projects:8080/").unwrap();
        assert_eq!(c.project_url("p1"), "http://projects:8080/projects/p1");
        assert_eq!(
            c.manifest_url("p1", "d1", ManifestKind::Run),
            "http://projects:8080/projects/p1/deployments/d1/manifest?config=run"
        );
    }

    #[test]
    fn project_info_decodes_with_and_without_deployment() {
        let with: ProjectInfo = serde_json::from_str(
            r#"{"id":"p1","applicationType":"DYNAMIC","latestDeployment":{"id":"d9","commitHash":"abc"}}"#,
        )
        .unwrap();
        let latest = with.into_latest().unwrap();
        assert_eq!(latest.deployment_id, "d9");
        assert_eq!(latest.project_type, ProjectType::Dynamic);

        let without: ProjectInfo = serde_json::from_str(r#"{"id":"p1","applicationType":"STATIC"}"#).unwrap();
        assert!(without.into_latest().is_none());
    }

    #[test]
    fn manifest_decodes() {
        let m: ContainerManifest =
            serde_json::from_str(r#"{"image":"r/app:1","env":{"PORT":"3000"},"containerId":"c1"}"#).unwrap();
        assert_eq!(m.port(), Some(3000));
    }

    #[tokio::test]
    async fn memory_projects() {
        let p = MemoryProjects::new();
        assert!(p.latest_deployment("p1").await.is_err());
        p.put_project(ProjectInfo { id: "p1".into(), application_type: ProjectType::Static, latest_deployment: None });
        assert!(p.latest_deployment("p1").await.unwrap().is_none());
        p.put_manifest("p1", "d1", ManifestKind::Build, ContainerManifest { image: "img".into(), ..Default::default() });
        assert_eq!(p.container_manifest("p1", "d1", ManifestKind::Build).await.unwrap().image, "img");
        assert!(p.container_manifest("p1", "d1", ManifestKind::Run).await.is_err());
    }
}
