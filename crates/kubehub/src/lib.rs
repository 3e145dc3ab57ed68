//! Keel kubehub: kube client wiring, node memory admission, workload phase watch.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use kube::{config::KubeConfigOptions, Client};
use tracing::info;

mod admission;
mod quantity;
mod watch;

pub use admission::{Admission, AdmissionController, KubeNodeMemory, MemorySampler, DEFAULT_THRESHOLD_PERCENT};
pub use quantity::parse_quantity;
pub use watch::{watch_workloads, PodPhase, WorkloadPhase};

/// Value of [`MANAGED_BY_LABEL`] on everything keel creates.
pub const MANAGER_NAME: &str = "keel";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const PROJECT_LABEL: &str = "keel.dev/project-id";
pub const DEPLOYMENT_LABEL: &str = "keel.dev/deployment-id";
pub const PROJECT_TYPE_LABEL: &str = "keel.dev/project-type";
/// Raw ids live in annotations; label values are sanitized and may differ from the id.
pub const PROJECT_ANNOTATION: &str = "keel.dev/project-id";
pub const DEPLOYMENT_ANNOTATION: &str = "keel.dev/deployment-id";

/// Build a client from the pod's service account (`in_cluster`) or the local kubeconfig.
pub async fn connect(in_cluster: bool) -> Result<Client> {
    let config = if in_cluster {
        kube::Config::incluster().context("loading in-cluster service account config")?
    } else {
        kube::Config::from_kubeconfig(&KubeConfigOptions::default()).await.context("loading local kubeconfig")?
    };
    info!(cluster = %config.cluster_url, in_cluster, "kube client configured");
    Client::try_from(config).context("building kube client")
}

/// Label selector matching every workload keel manages.
pub fn managed_selector() -> String {
    format!("{}={}", MANAGED_BY_LABEL, MANAGER_NAME)
}
