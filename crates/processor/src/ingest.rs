//! Stream handlers feeding the queue.

use async_trait::async_trait;
use keel_core::{EventKind, ProjectEvent, ProjectEventKind, StreamEvent};
use keel_store::{QueueEntry, SharedQueue};
use keel_stream::{AckHandle, Delivery, StreamHandler};
use metrics::counter;
use tracing::{debug, info, warn};

async fn ack_or_warn(ack: &AckHandle, what: &str) {
    if let Err(e) = ack.ack().await {
        warn!(id = %ack.id(), error = %e, "ack of {} failed", what);
    }
}

/// Deployment-lifecycle entries go into the collapsing queue.
pub struct DeploymentIngest {
    queue: SharedQueue,
}

impl DeploymentIngest {
    pub fn new(queue: SharedQueue) -> Self { Self { queue } }
}

#[async_trait]
impl StreamHandler for DeploymentIngest {
    async fn handle(&self, delivery: Delivery, ack: AckHandle) {
        let event: StreamEvent = match delivery.decode() {
            Ok(e) => e,
            Err(e) => {
                counter!("ingest_undecodable_total", 1u64, "topic" => "deployment");
                warn!(id = %delivery.id(), error = %e, "undecodable deployment event; acking");
                ack_or_warn(&ack, "undecodable entry").await;
                return;
            }
        };
        // A CREATED can only be placed in a namespace once its project type is known.
        if event.kind == EventKind::Created && event.project_type.is_none() {
            counter!("ingest_undecodable_total", 1u64, "topic" => "deployment");
            warn!(id = %delivery.id(), project = %event.project_id, request_id = %event.request_id, "CREATED without projectType; acking");
            ack_or_warn(&ack, "untyped CREATED").await;
            return;
        }
        counter!("ingest_events_total", 1u64, "kind" => event.kind.as_str().to_string());
        debug!(id = %delivery.id(), kind = %event.kind, project = %event.project_id, deliveries = delivery.deliveries(), "deployment event queued");
        let entry = QueueEntry::new(event, ack).with_deliveries(delivery.deliveries());
        self.queue.offer(entry).await;
    }
}

/// Project-lifecycle entries: a deleted project takes its queued work with it.
pub struct ProjectIngest {
    queue: SharedQueue,
}

impl ProjectIngest {
    pub fn new(queue: SharedQueue) -> Self { Self { queue } }
}

#[async_trait]
impl StreamHandler for ProjectIngest {
    async fn handle(&self, delivery: Delivery, ack: AckHandle) {
        let event: ProjectEvent = match delivery.decode() {
            Ok(e) => e,
            Err(e) => {
                counter!("ingest_undecodable_total", 1u64, "topic" => "project");
                warn!(id = %delivery.id(), error = %e, "undecodable project event; acking");
                ack_or_warn(&ack, "undecodable entry").await;
                return;
            }
        };
        match &event.kind {
            ProjectEventKind::Deleted => {
                let purged = self.queue.purge_project(&event.project_id).await;
                info!(project = %event.project_id, purged, "project deleted; queued events purged");
            }
            ProjectEventKind::Created => debug!(project = %event.project_id, "project created"),
            ProjectEventKind::Other(k) => debug!(project = %event.project_id, kind = %k, "ignoring project event"),
        }
        ack_or_warn(&ack, "project event").await;
    }
}
