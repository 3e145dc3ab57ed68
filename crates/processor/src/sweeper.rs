use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use keel_core::{EventKind, ProjectType, StatusKind, StreamEvent};
use keel_persist::{now_ts, WorkloadStore};
use keel_stream::{publish, StreamBroker};
use metrics::counter;
use tokio::sync::watch;
use tracing::{error, info};

/// Publishes DELETED for dynamic workloads that have not seen traffic in a while.
pub struct IdleSweeper {
    store: Arc<dyn WorkloadStore>,
    broker: Arc<dyn StreamBroker>,
    topic: String,
    idle_after: Duration,
}

impl IdleSweeper {
    pub fn new(store: Arc<dyn WorkloadStore>, broker: Arc<dyn StreamBroker>, topic: &str, idle_after: Duration) -> Self {
        Self { store, broker, topic: topic.to_string(), idle_after }
    }

    /// One pass. Returns how many DELETED events were published.
    pub async fn sweep_once(&self) -> Result<usize> {
        let cutoff = now_ts() - self.idle_after.as_secs() as i64;
        let stale = self.store.find_stale(StatusKind::Running, ProjectType::Dynamic, cutoff)?;
        for rec in &stale {
            let ev = StreamEvent {
                kind: EventKind::Deleted,
                project_id: rec.project_id.clone(),
                deployment_id: rec.deployment_id.clone(),
                commit_hash: String::new(),
                project_type: Some(ProjectType::Dynamic),
                request_id: uuid::Uuid::new_v4().to_string(),
            };
            publish(self.broker.as_ref(), &self.topic, &ev).await?;
            info!(project = %rec.project_id, deployment = %rec.deployment_id, idle_since = rec.last_ingressed_at, "idle workload scheduled for deletion");
        }
        counter!("sweeper_deleted_total", stale.len() as u64);
        Ok(stale.len())
    }

    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), idle_secs = self.idle_after.as_secs(), "idle sweeper started");
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "idle sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("idle sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }
}
