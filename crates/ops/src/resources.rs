//! Object builders for project workloads.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, LocalObjectReference, Pod, PodSpec, PodTemplateSpec, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use keel_core::{ContainerManifest, ProjectType};
use keel_kubehub::{
    DEPLOYMENT_ANNOTATION, DEPLOYMENT_LABEL, MANAGED_BY_LABEL, MANAGER_NAME, PROJECT_ANNOTATION, PROJECT_LABEL,
    PROJECT_TYPE_LABEL,
};
use kube::api::ObjectMeta;
use sha2::{Digest, Sha256};

use crate::ClusterError;

/// External port every dynamic project is reachable on.
pub const SERVICE_PORT: i32 = 80;
const CONTAINER_NAME: &str = "app";

/// Everything needed to run one project's container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub project_id: String,
    pub deployment_id: String,
    pub project_type: ProjectType,
    pub manifest: ContainerManifest,
}

impl Workload {
    pub fn name(&self) -> String { resource_name(&self.project_id) }
}

const NAME_MAX: usize = 63;
const HASH_LEN: usize = 8;

/// DNS-1123 label derived from a project id.
///
/// An id that is already a valid label is used as is. Any id that had to be
/// rewritten or truncated gets a short hash of the raw id appended, so two
/// distinct ids never share a name.
pub fn resource_name(id: &str) -> String {
    let sanitized: String = id
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let trimmed = sanitized.trim_matches('-');
    if !trimmed.is_empty() && trimmed == id && id.len() <= NAME_MAX {
        return id.to_string();
    }
    let digest = hex::encode(Sha256::digest(id.as_bytes()));
    let suffix = &digest[..HASH_LEN];
    let mut base: String = trimmed.chars().take(NAME_MAX - HASH_LEN - 1).collect();
    while base.ends_with('-') {
        base.pop();
    }
    if base.is_empty() { format!("project-{suffix}") } else { format!("{base}-{suffix}") }
}

fn label_value(id: &str) -> String {
    if id.is_empty() { String::new() } else { resource_name(id) }
}

fn labels(w: &Workload) -> BTreeMap<String, String> {
    let mut l = BTreeMap::new();
    l.insert(MANAGED_BY_LABEL.to_string(), MANAGER_NAME.to_string());
    l.insert(PROJECT_LABEL.to_string(), label_value(&w.project_id));
    l.insert(DEPLOYMENT_LABEL.to_string(), label_value(&w.deployment_id));
    l.insert(PROJECT_TYPE_LABEL.to_string(), w.project_type.as_str().to_string());
    l
}

fn annotations(w: &Workload) -> BTreeMap<String, String> {
    let mut a = BTreeMap::new();
    a.insert(PROJECT_ANNOTATION.to_string(), w.project_id.clone());
    a.insert(DEPLOYMENT_ANNOTATION.to_string(), w.deployment_id.clone());
    a
}

fn selector(project_id: &str) -> BTreeMap<String, String> {
    let mut l = BTreeMap::new();
    l.insert(PROJECT_LABEL.to_string(), label_value(project_id));
    l
}

fn container(m: &ContainerManifest) -> Container {
    let env = m
        .env
        .iter()
        .map(|(k, v)| EnvVar { name: k.clone(), value: Some(v.clone()), ..Default::default() })
        .collect::<Vec<_>>();
    let ports = m.port().map(|p| vec![ContainerPort { container_port: p as i32, ..Default::default() }]);
    Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(m.image.clone()),
        env: if env.is_empty() { None } else { Some(env) },
        ports,
        ..Default::default()
    }
}

/// Placement and registry settings shared by every workload.
#[derive(Debug, Clone, Default)]
pub struct PodPlacement {
    pub node_name: Option<String>,
    pub pull_secret: Option<String>,
}

fn pod_spec(w: &Workload, placement: &PodPlacement, restart: &str) -> PodSpec {
    PodSpec {
        containers: vec![container(&w.manifest)],
        restart_policy: Some(restart.to_string()),
        node_name: placement.node_name.clone(),
        image_pull_secrets: placement
            .pull_secret
            .as_ref()
            .map(|s| vec![LocalObjectReference { name: Some(s.clone()) }]),
        ..Default::default()
    }
}

/// Static projects run their build once; dynamic ones keep serving.
pub fn build_pod(w: &Workload, namespace: &str, placement: &PodPlacement) -> Pod {
    let restart = match w.project_type {
        ProjectType::Static => "Never",
        ProjectType::Dynamic => "Always",
    };
    Pod {
        metadata: ObjectMeta {
            name: Some(w.name()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels(w)),
            annotations: Some(annotations(w)),
            ..Default::default()
        },
        spec: Some(pod_spec(w, placement, restart)),
        ..Default::default()
    }
}

pub fn build_service(w: &Workload, namespace: &str) -> Result<Service, ClusterError> {
    let port = w
        .manifest
        .port()
        .ok_or_else(|| ClusterError::Invalid(format!("project {} declares no PORT", w.project_id)))?;
    Ok(Service {
        metadata: ObjectMeta {
            name: Some(w.name()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels(w)),
            annotations: Some(annotations(w)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector(&w.project_id)),
            ports: Some(vec![ServicePort {
                name: Some("http".into()),
                port: SERVICE_PORT,
                target_port: Some(IntOrString::Int(port as i32)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub fn build_deployment(w: &Workload, namespace: &str, placement: &PodPlacement, replicas: i32) -> Deployment {
    let labels = labels(w);
    Deployment {
        metadata: ObjectMeta {
            name: Some(w.name()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            annotations: Some(annotations(w)),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector { match_labels: Some(selector(&w.project_id)), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(annotations(w)),
                    ..Default::default()
                }),
                spec: Some(pod_spec(w, placement, "Always")),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
