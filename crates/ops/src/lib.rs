//! Keel ops: imperative workload management on the free-tier node.
//!
//! The [`ResourceManager`] owns the create/expose/delete sequences; the
//! cluster itself sits behind [`WorkloadApi`] so the sequences can be driven
//! against [`MemoryWorkloadApi`] in tests.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};

mod error;
mod kube_api;
mod manager;
mod memory;
pub mod resources;

pub use error::ClusterError;
pub use kube_api::KubeWorkloadApi;
pub use manager::{ManagerConfig, ResourceManager};
pub use memory::{Call, MemoryWorkloadApi};
pub use resources::{resource_name, PodPlacement, Workload};

/// Object-level cluster operations used by the manager.
///
/// Implementations map a missing object to [`ClusterError::NotFound`] and an
/// existing one on create to [`ClusterError::Conflict`].
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    async fn create_namespace(&self, name: &str) -> Result<(), ClusterError>;

    async fn get_pod(&self, ns: &str, name: &str) -> Result<Pod, ClusterError>;
    async fn create_pod(&self, ns: &str, pod: &Pod) -> Result<(), ClusterError>;
    async fn delete_pod(&self, ns: &str, name: &str) -> Result<(), ClusterError>;

    async fn get_service(&self, ns: &str, name: &str) -> Result<Service, ClusterError>;
    async fn create_service(&self, ns: &str, svc: &Service) -> Result<(), ClusterError>;
    async fn replace_service(&self, ns: &str, name: &str, svc: &Service) -> Result<(), ClusterError>;
    async fn delete_service(&self, ns: &str, name: &str) -> Result<(), ClusterError>;

    async fn get_deployment(&self, ns: &str, name: &str) -> Result<Deployment, ClusterError>;
    async fn create_deployment(&self, ns: &str, d: &Deployment) -> Result<(), ClusterError>;
    async fn replace_deployment(&self, ns: &str, name: &str, d: &Deployment) -> Result<(), ClusterError>;
    async fn delete_deployment(&self, ns: &str, name: &str) -> Result<(), ClusterError>;
}
