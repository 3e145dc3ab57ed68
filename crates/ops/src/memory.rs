//! In-memory [`WorkloadApi`] with apiserver-like conflict and termination behaviour.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};

use crate::{ClusterError, WorkloadApi};

type Key = (String, String);

/// A mutating call or pod lookup, in the order it reached the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateNamespace(String),
    GetPod { ns: String, name: String, found: bool },
    CreatePod { ns: String, name: String },
    DeletePod { ns: String, name: String },
    CreateService { ns: String, name: String },
    ReplaceService { ns: String, name: String },
    DeleteService { ns: String, name: String },
    CreateDeployment { ns: String, name: String },
    ReplaceDeployment { ns: String, name: String },
    DeleteDeployment { ns: String, name: String },
}

#[derive(Default)]
struct State {
    namespaces: BTreeSet<String>,
    pods: BTreeMap<Key, Pod>,
    /// Lookups a deleted pod stays visible for.
    terminating: HashMap<Key, u32>,
    services: BTreeMap<Key, Service>,
    deployments: BTreeMap<Key, Deployment>,
    calls: Vec<Call>,
    termination_polls: u32,
    fail_pod_creates: Option<ClusterError>,
    next_version: u64,
}

impl State {
    fn version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

#[derive(Default)]
pub struct MemoryWorkloadApi {
    state: Mutex<State>,
}

fn key(ns: &str, name: &str) -> Key { (ns.to_string(), name.to_string()) }

fn not_found(kind: &str, ns: &str, name: &str) -> ClusterError {
    ClusterError::NotFound(format!("{} {}/{}", kind, ns, name))
}

impl MemoryWorkloadApi {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> { self.state.lock().unwrap_or_else(|p| p.into_inner()) }

    /// Deleted pods stay visible for `n` lookups before disappearing.
    pub fn with_termination_polls(self, n: u32) -> Self {
        self.lock().termination_polls = n;
        self
    }

    /// Make every pod create fail with `err` until cleared with `None`.
    pub fn fail_pod_creates(&self, err: Option<ClusterError>) { self.lock().fail_pod_creates = err; }

    pub fn insert_pod(&self, ns: &str, pod: Pod) {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.lock().pods.insert(key(ns, &name), pod);
    }

    pub fn pod(&self, ns: &str, name: &str) -> Option<Pod> { self.lock().pods.get(&key(ns, name)).cloned() }
    pub fn service(&self, ns: &str, name: &str) -> Option<Service> { self.lock().services.get(&key(ns, name)).cloned() }
    pub fn deployment(&self, ns: &str, name: &str) -> Option<Deployment> {
        self.lock().deployments.get(&key(ns, name)).cloned()
    }
    pub fn namespaces(&self) -> Vec<String> { self.lock().namespaces.iter().cloned().collect() }
    pub fn calls(&self) -> Vec<Call> { self.lock().calls.clone() }

    /// Pod creates seen so far.
    pub fn pod_creates(&self) -> usize {
        self.lock().calls.iter().filter(|c| matches!(c, Call::CreatePod { .. })).count()
    }
}

#[async_trait]
impl WorkloadApi for MemoryWorkloadApi {
    async fn create_namespace(&self, name: &str) -> Result<(), ClusterError> {
        let mut s = self.lock();
        s.calls.push(Call::CreateNamespace(name.to_string()));
        if !s.namespaces.insert(name.to_string()) {
            return Err(ClusterError::Conflict(format!("namespace {} already exists", name)));
        }
        Ok(())
    }

    async fn get_pod(&self, ns: &str, name: &str) -> Result<Pod, ClusterError> {
        let mut s = self.lock();
        let k = key(ns, name);
        if let Some(left) = s.terminating.get_mut(&k) {
            if *left == 0 {
                s.terminating.remove(&k);
                s.pods.remove(&k);
            } else {
                *left -= 1;
            }
        }
        let found = s.pods.get(&k).cloned();
        s.calls.push(Call::GetPod { ns: ns.into(), name: name.into(), found: found.is_some() });
        found.ok_or_else(|| not_found("pod", ns, name))
    }

    async fn create_pod(&self, ns: &str, pod: &Pod) -> Result<(), ClusterError> {
        let mut s = self.lock();
        let name = pod.metadata.name.clone().unwrap_or_default();
        s.calls.push(Call::CreatePod { ns: ns.into(), name: name.clone() });
        if let Some(e) = s.fail_pod_creates.clone() {
            return Err(e);
        }
        let k = key(ns, &name);
        if s.pods.contains_key(&k) {
            return Err(ClusterError::Conflict(format!("pod {}/{} already exists", ns, name)));
        }
        s.pods.insert(k, pod.clone());
        Ok(())
    }

    async fn delete_pod(&self, ns: &str, name: &str) -> Result<(), ClusterError> {
        let mut s = self.lock();
        s.calls.push(Call::DeletePod { ns: ns.into(), name: name.into() });
        let k = key(ns, name);
        if !s.pods.contains_key(&k) {
            return Err(not_found("pod", ns, name));
        }
        if s.termination_polls == 0 {
            s.pods.remove(&k);
        } else if !s.terminating.contains_key(&k) {
            let n = s.termination_polls;
            s.terminating.insert(k, n);
        }
        Ok(())
    }

    async fn get_service(&self, ns: &str, name: &str) -> Result<Service, ClusterError> {
        self.lock().services.get(&key(ns, name)).cloned().ok_or_else(|| not_found("service", ns, name))
    }

    async fn create_service(&self, ns: &str, svc: &Service) -> Result<(), ClusterError> {
        let mut s = self.lock();
        let name = svc.metadata.name.clone().unwrap_or_default();
        s.calls.push(Call::CreateService { ns: ns.into(), name: name.clone() });
        let k = key(ns, &name);
        if s.services.contains_key(&k) {
            return Err(ClusterError::Conflict(format!("service {}/{} already exists", ns, name)));
        }
        let mut stored = svc.clone();
        stored.metadata.resource_version = Some(s.version());
        if let Some(spec) = stored.spec.as_mut() {
            spec.cluster_ip = Some(format!("10.96.0.{}", s.services.len() + 1));
        }
        s.services.insert(k, stored);
        Ok(())
    }

    async fn replace_service(&self, ns: &str, name: &str, svc: &Service) -> Result<(), ClusterError> {
        let mut s = self.lock();
        s.calls.push(Call::ReplaceService { ns: ns.into(), name: name.into() });
        let k = key(ns, name);
        let current = s.services.get(&k).ok_or_else(|| not_found("service", ns, name))?;
        if current.metadata.resource_version != svc.metadata.resource_version {
            return Err(ClusterError::Conflict(format!("service {}/{} resourceVersion mismatch", ns, name)));
        }
        let mut stored = svc.clone();
        stored.metadata.resource_version = Some(s.version());
        s.services.insert(k, stored);
        Ok(())
    }

    async fn delete_service(&self, ns: &str, name: &str) -> Result<(), ClusterError> {
        let mut s = self.lock();
        s.calls.push(Call::DeleteService { ns: ns.into(), name: name.into() });
        s.services.remove(&key(ns, name)).map(|_| ()).ok_or_else(|| not_found("service", ns, name))
    }

    async fn get_deployment(&self, ns: &str, name: &str) -> Result<Deployment, ClusterError> {
        self.lock().deployments.get(&key(ns, name)).cloned().ok_or_else(|| not_found("deployment", ns, name))
    }

    async fn create_deployment(&self, ns: &str, d: &Deployment) -> Result<(), ClusterError> {
        let mut s = self.lock();
        let name = d.metadata.name.clone().unwrap_or_default();
        s.calls.push(Call::CreateDeployment { ns: ns.into(), name: name.clone() });
        let k = key(ns, &name);
        if s.deployments.contains_key(&k) {
            return Err(ClusterError::Conflict(format!("deployment {}/{} already exists", ns, name)));
        }
        let mut stored = d.clone();
        stored.metadata.resource_version = Some(s.version());
        s.deployments.insert(k, stored);
        Ok(())
    }

    async fn replace_deployment(&self, ns: &str, name: &str, d: &Deployment) -> Result<(), ClusterError> {
        let mut s = self.lock();
        s.calls.push(Call::ReplaceDeployment { ns: ns.into(), name: name.into() });
        let k = key(ns, name);
        let current = s.deployments.get(&k).ok_or_else(|| not_found("deployment", ns, name))?;
        if current.metadata.resource_version != d.metadata.resource_version {
            return Err(ClusterError::Conflict(format!("deployment {}/{} resourceVersion mismatch", ns, name)));
        }
        let mut stored = d.clone();
        stored.metadata.resource_version = Some(s.version());
        s.deployments.insert(k, stored);
        Ok(())
    }

    async fn delete_deployment(&self, ns: &str, name: &str) -> Result<(), ClusterError> {
        let mut s = self.lock();
        s.calls.push(Call::DeleteDeployment { ns: ns.into(), name: name.into() });
        s.deployments.remove(&key(ns, name)).map(|_| ()).ok_or_else(|| not_found("deployment", ns, name))
    }
}
