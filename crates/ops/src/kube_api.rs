use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Pod, Service};
use kube::{
    api::{Api, DeleteParams, ObjectMeta, PostParams},
    Client,
};

use crate::{ClusterError, WorkloadApi};

/// [`WorkloadApi`] backed by kube-rs.
#[derive(Clone)]
pub struct KubeWorkloadApi {
    client: Client,
}

impl KubeWorkloadApi {
    pub fn new(client: Client) -> Self { Self { client } }

    fn pods(&self, ns: &str) -> Api<Pod> { Api::namespaced(self.client.clone(), ns) }
    fn services(&self, ns: &str) -> Api<Service> { Api::namespaced(self.client.clone(), ns) }
    fn deployments(&self, ns: &str) -> Api<Deployment> { Api::namespaced(self.client.clone(), ns) }
}

#[async_trait]
impl WorkloadApi for KubeWorkloadApi {
    async fn create_namespace(&self, name: &str) -> Result<(), ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace { metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() }, ..Default::default() };
        api.create(&PostParams::default(), &ns).await?;
        Ok(())
    }

    async fn get_pod(&self, ns: &str, name: &str) -> Result<Pod, ClusterError> {
        Ok(self.pods(ns).get(name).await?)
    }

    async fn create_pod(&self, ns: &str, pod: &Pod) -> Result<(), ClusterError> {
        self.pods(ns).create(&PostParams::default(), pod).await?;
        Ok(())
    }

    async fn delete_pod(&self, ns: &str, name: &str) -> Result<(), ClusterError> {
        self.pods(ns).delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn get_service(&self, ns: &str, name: &str) -> Result<Service, ClusterError> {
        Ok(self.services(ns).get(name).await?)
    }

    async fn create_service(&self, ns: &str, svc: &Service) -> Result<(), ClusterError> {
        self.services(ns).create(&PostParams::default(), svc).await?;
        Ok(())
    }

    async fn replace_service(&self, ns: &str, name: &str, svc: &Service) -> Result<(), ClusterError> {
        self.services(ns).replace(name, &PostParams::default(), svc).await?;
        Ok(())
    }

    async fn delete_service(&self, ns: &str, name: &str) -> Result<(), ClusterError> {
        self.services(ns).delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn get_deployment(&self, ns: &str, name: &str) -> Result<Deployment, ClusterError> {
        Ok(self.deployments(ns).get(name).await?)
    }

    async fn create_deployment(&self, ns: &str, d: &Deployment) -> Result<(), ClusterError> {
        self.deployments(ns).create(&PostParams::default(), d).await?;
        Ok(())
    }

    async fn replace_deployment(&self, ns: &str, name: &str, d: &Deployment) -> Result<(), ClusterError> {
        self.deployments(ns).replace(name, &PostParams::default(), d).await?;
        Ok(())
    }

    async fn delete_deployment(&self, ns: &str, name: &str) -> Result<(), ClusterError> {
        self.deployments(ns).delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}
