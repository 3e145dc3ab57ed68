use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use keel_core::NodeMemorySample;
use kube::{
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Api, Client,
};
use metrics::{counter, gauge};
use tracing::{debug, warn};

use crate::quantity::parse_quantity;

pub const DEFAULT_THRESHOLD_PERCENT: f64 = 90.0;

/// Source of node memory samples.
#[async_trait]
pub trait MemorySampler: Send + Sync {
    async fn sample(&self) -> Result<NodeMemorySample>;
}

/// Reads capacity from the Node object and usage from metrics-server.
pub struct KubeNodeMemory {
    client: Client,
    node: String,
}

impl KubeNodeMemory {
    pub fn new(client: Client, node: impl Into<String>) -> Self { Self { client, node: node.into() } }
}

#[async_trait]
impl MemorySampler for KubeNodeMemory {
    async fn sample(&self) -> Result<NodeMemorySample> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node = nodes.get(&self.node).await.with_context(|| format!("getting node {}", self.node))?;
        let capacity = node
            .status
            .and_then(|s| s.capacity)
            .and_then(|c| c.get("memory").map(|q| q.0.clone()))
            .ok_or_else(|| anyhow!("node {} reports no memory capacity", self.node))?;
        let total_bytes = parse_quantity(&capacity)?;

        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "NodeMetrics");
        let ar = ApiResource::from_gvk_with_plural(&gvk, "nodes");
        let metrics_api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let m = metrics_api.get(&self.node).await.with_context(|| format!("getting node metrics for {}", self.node))?;
        let usage = m
            .data
            .get("usage")
            .and_then(|u| u.get("memory"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("node metrics for {} carry no usage.memory", self.node))?;
        let used_bytes = parse_quantity(usage)?;
        debug!(node = %self.node, used_bytes, total_bytes, "node memory sampled");
        Ok(NodeMemorySample { used_bytes, total_bytes })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Admit { usage: f64 },
    Reject { usage: f64 },
}

impl Admission {
    pub fn admitted(&self) -> bool { matches!(self, Admission::Admit { .. }) }
}

/// Gate in front of workload creation on the shared free-tier node.
pub struct AdmissionController {
    sampler: Box<dyn MemorySampler>,
    threshold: f64,
}

impl AdmissionController {
    pub fn new(sampler: Box<dyn MemorySampler>) -> Self { Self { sampler, threshold: DEFAULT_THRESHOLD_PERCENT } }

    pub fn with_threshold(mut self, percent: f64) -> Self {
        self.threshold = percent;
        self
    }

    pub fn threshold(&self) -> f64 { self.threshold }

    /// Usage at or above the threshold rejects. A failed sample admits.
    pub async fn check(&self) -> Admission {
        let usage = match self.sampler.sample().await {
            Ok(s) => s.usage_percent(),
            Err(e) => {
                counter!("admission_sample_errors_total", 1u64);
                warn!(error = %e, "node memory sample failed; admitting");
                0.0
            }
        };
        gauge!("node_memory_usage_percent", usage);
        if usage >= self.threshold {
            counter!("admission_rejected_total", 1u64);
            Admission::Reject { usage }
        } else {
            Admission::Admit { usage }
        }
    }
}
