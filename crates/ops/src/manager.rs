use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_core::ProjectType;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::resources::{build_deployment, build_pod, build_service, resource_name, PodPlacement, Workload};
use crate::{ClusterError, WorkloadApi};

/// Poll rounds between warn-level reports of a pod stuck terminating.
const STUCK_WARN_EVERY: u32 = 30;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub static_namespace: String,
    pub dynamic_namespace: String,
    pub placement: PodPlacement,
    pub poll_interval: Duration,
    /// `None` polls until the pod is gone.
    pub max_polls: Option<u32>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            static_namespace: "keel-static".into(),
            dynamic_namespace: "keel-dynamic".into(),
            placement: PodPlacement::default(),
            poll_interval: Duration::from_secs(1),
            max_polls: None,
        }
    }
}

pub struct ResourceManager {
    api: Arc<dyn WorkloadApi>,
    cfg: ManagerConfig,
}

impl ResourceManager {
    pub fn new(api: Arc<dyn WorkloadApi>, cfg: ManagerConfig) -> Self { Self { api, cfg } }

    pub fn config(&self) -> &ManagerConfig { &self.cfg }

    pub fn namespace_for(&self, pt: ProjectType) -> &str {
        match pt {
            ProjectType::Static => &self.cfg.static_namespace,
            ProjectType::Dynamic => &self.cfg.dynamic_namespace,
        }
    }

    /// Create both project namespaces; existing ones are fine.
    pub async fn ensure_namespaces(&self) -> Result<(), ClusterError> {
        for ns in [&self.cfg.static_namespace, &self.cfg.dynamic_namespace] {
            match self.api.create_namespace(ns).await {
                Ok(()) => info!(ns = %ns, "namespace created"),
                Err(e) if e.is_conflict() => debug!(ns = %ns, "namespace already exists"),
                Err(e) => {
                    warn!(ns = %ns, error = %e, "namespace create failed");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Replace whatever runs for the project with a fresh pod.
    pub async fn create(&self, w: &Workload) -> Result<(), ClusterError> {
        let ns = self.namespace_for(w.project_type);
        let name = w.name();
        let t0 = Instant::now();
        match self.api.delete_pod(ns, &name).await {
            Ok(()) => debug!(ns = %ns, pod = %name, "existing pod deleted"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(self.failed("create", ns, &name, e)),
        }
        self.wait_pod_gone(ns, &name).await.map_err(|e| self.failed("create", ns, &name, e))?;
        let pod = build_pod(w, ns, &self.cfg.placement);
        self.api.create_pod(ns, &pod).await.map_err(|e| self.failed("create", ns, &name, e))?;
        histogram!("cluster_create_ms", t0.elapsed().as_millis() as f64);
        counter!("cluster_ops_total", 1u64, "op" => "create");
        info!(ns = %ns, pod = %name, project = %w.project_id, deployment = %w.deployment_id, image = %w.manifest.image, "pod created");
        Ok(())
    }

    /// Upsert the Service mapping port 80 to the container's `PORT`.
    pub async fn expose(&self, w: &Workload) -> Result<(), ClusterError> {
        let ns = self.namespace_for(w.project_type);
        let name = w.name();
        let mut svc = build_service(w, ns).map_err(|e| self.failed("expose", ns, &name, e))?;
        match self.api.get_service(ns, &name).await {
            Ok(existing) => {
                svc.metadata.resource_version = existing.metadata.resource_version;
                if let (Some(spec), Some(old)) = (svc.spec.as_mut(), existing.spec) {
                    spec.cluster_ip = old.cluster_ip;
                }
                match self.api.replace_service(ns, &name, &svc).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        svc.metadata.resource_version = None;
                        self.api.create_service(ns, &svc).await.map_err(|e| self.failed("expose", ns, &name, e))?;
                    }
                    Err(e) => return Err(self.failed("expose", ns, &name, e)),
                }
            }
            Err(e) if e.is_not_found() => {
                self.api.create_service(ns, &svc).await.map_err(|e| self.failed("expose", ns, &name, e))?;
            }
            Err(e) => return Err(self.failed("expose", ns, &name, e)),
        }
        counter!("cluster_ops_total", 1u64, "op" => "expose");
        info!(ns = %ns, service = %name, project = %w.project_id, "service exposed");
        Ok(())
    }

    /// Create the pod unless it already exists. Never deletes.
    pub async fn recreate_if_missing(&self, w: &Workload) -> Result<(), ClusterError> {
        let ns = self.namespace_for(w.project_type);
        let name = w.name();
        let pod = build_pod(w, ns, &self.cfg.placement);
        match self.api.create_pod(ns, &pod).await {
            Ok(()) => info!(ns = %ns, pod = %name, project = %w.project_id, "pod recreated"),
            Err(e) if e.is_conflict() => debug!(ns = %ns, pod = %name, "pod already running"),
            Err(e) => return Err(self.failed("recreate", ns, &name, e)),
        }
        counter!("cluster_ops_total", 1u64, "op" => "recreate");
        Ok(())
    }

    /// Delete the project's pod and Service, waiting for the pod to go away.
    pub async fn delete(&self, project_id: &str, pt: ProjectType) -> Result<(), ClusterError> {
        let ns = self.namespace_for(pt);
        let name = resource_name(project_id);
        match self.api.delete_pod(ns, &name).await {
            Ok(()) => {
                self.wait_pod_gone(ns, &name).await.map_err(|e| self.failed("delete", ns, &name, e))?;
            }
            Err(e) if e.is_not_found() => debug!(ns = %ns, pod = %name, "pod already gone"),
            Err(e) => return Err(self.failed("delete", ns, &name, e)),
        }
        match self.api.delete_service(ns, &name).await {
            Ok(()) | Err(ClusterError::NotFound(_)) => {}
            Err(e) => return Err(self.failed("delete", ns, &name, e)),
        }
        counter!("cluster_ops_total", 1u64, "op" => "delete");
        info!(ns = %ns, pod = %name, project = %project_id, "workload deleted");
        Ok(())
    }

    /// Create or replace a Deployment for the project (paid tier).
    pub async fn apply_deployment(&self, w: &Workload, replicas: i32) -> Result<(), ClusterError> {
        let ns = self.namespace_for(w.project_type);
        let name = w.name();
        let mut d = build_deployment(w, ns, &self.cfg.placement, replicas);
        let res = match self.api.get_deployment(ns, &name).await {
            Ok(existing) => {
                d.metadata.resource_version = existing.metadata.resource_version;
                self.api.replace_deployment(ns, &name, &d).await
            }
            Err(e) if e.is_not_found() => self.api.create_deployment(ns, &d).await,
            Err(e) => Err(e),
        };
        res.map_err(|e| self.failed("apply_deployment", ns, &name, e))?;
        info!(ns = %ns, deployment = %name, replicas, "deployment applied");
        Ok(())
    }

    pub async fn delete_deployment(&self, project_id: &str, pt: ProjectType) -> Result<(), ClusterError> {
        let ns = self.namespace_for(pt);
        let name = resource_name(project_id);
        match self.api.delete_deployment(ns, &name).await {
            Ok(()) | Err(ClusterError::NotFound(_)) => Ok(()),
            Err(e) => Err(self.failed("delete_deployment", ns, &name, e)),
        }
    }

    async fn wait_pod_gone(&self, ns: &str, name: &str) -> Result<(), ClusterError> {
        let mut polls: u32 = 0;
        loop {
            match self.api.get_pod(ns, name).await {
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
                Ok(_) => {}
            }
            polls += 1;
            if let Some(max) = self.cfg.max_polls {
                if polls >= max {
                    return Err(ClusterError::Timeout { what: format!("pod {}/{}", ns, name), polls });
                }
            }
            if polls % STUCK_WARN_EVERY == 0 {
                warn!(ns = %ns, pod = %name, polls, "pod still terminating; processor is blocked");
            } else {
                debug!(ns = %ns, pod = %name, polls, "waiting for pod to terminate");
            }
            tokio::time::sleep(self.cfg.poll_interval).await;
        }
    }

    fn failed(&self, op: &'static str, ns: &str, name: &str, e: ClusterError) -> ClusterError {
        counter!("cluster_errors_total", 1u64, "op" => op);
        warn!(op, ns = %ns, name = %name, error = %e, "cluster operation failed");
        e
    }
}
