use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_api::ProjectsApi;
use keel_core::{EventKind, ManifestKind, ProjectType, StatusEvent, StatusKind, StreamEvent, WorkloadRecord};
use keel_kubehub::{Admission, AdmissionController};
use keel_ops::{ResourceManager, Workload};
use keel_persist::{now_ts, WorkloadStore};
use keel_store::{QueueEntry, SharedQueue};
use keel_stream::StatusProducer;
use metrics::{counter, histogram};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{HandlerError, IdleBackoff};

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Ack a failing entry once it has been delivered this many times.
    pub max_deliveries: Option<u64>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self { backoff_base: Duration::from_secs(1), backoff_max: Duration::from_secs(10), max_deliveries: None }
    }
}

/// What happened to an entry that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Applied,
    Rejected { usage: f64 },
}

/// How an entry left the processor; returned for observability and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Acked(Outcome),
    /// Unknown kind, logged and acknowledged.
    Dropped,
    /// Failed and left pending for backlog recovery.
    Pending,
    /// Failed too many times and acknowledged anyway.
    Poisoned,
}

pub struct Processor {
    queue: SharedQueue,
    admission: AdmissionController,
    resources: Arc<ResourceManager>,
    projects: Arc<dyn ProjectsApi>,
    store: Arc<dyn WorkloadStore>,
    status: StatusProducer,
    cfg: ProcessorConfig,
}

impl Processor {
    pub fn new(
        queue: SharedQueue,
        admission: AdmissionController,
        resources: Arc<ResourceManager>,
        projects: Arc<dyn ProjectsApi>,
        store: Arc<dyn WorkloadStore>,
        status: StatusProducer,
        cfg: ProcessorConfig,
    ) -> Self {
        Self { queue, admission, resources, projects, store, status, cfg }
    }

    /// Drain the queue until `shutdown` flips to true, backing off while idle.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(max_deliveries = ?self.cfg.max_deliveries, "processor started");
        let mut backoff = IdleBackoff::new(self.cfg.backoff_base, self.cfg.backoff_max);
        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.process_next().await.is_some() {
                backoff.reset();
                continue;
            }
            let delay = backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "queue empty");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() { break; }
                }
            }
        }
        info!("processor stopped");
    }

    /// Pop and process one entry. `None` when the queue is empty.
    pub async fn process_next(&self) -> Option<Disposition> {
        let entry = self.queue.pop()?;
        Some(self.process(entry).await)
    }

    pub async fn process(&self, entry: QueueEntry) -> Disposition {
        let started = Instant::now();
        let QueueEntry { event, ack, deliveries } = entry;
        let result = self.dispatch(&event).await;
        histogram!("process_ms", started.elapsed().as_secs_f64() * 1000.0);

        let disposition = match result {
            Ok(outcome) => {
                if let Outcome::Rejected { usage } = outcome {
                    warn!(kind = %event.kind, project = %event.project_id, usage, "admission rejected");
                    let reason = format!("node memory at {:.1}%", usage);
                    self.report(StatusEvent::for_event(StatusKind::Failed, &event).with_reason(reason)).await;
                }
                Disposition::Acked(outcome)
            }
            Err(HandlerError::UnknownKind(k)) => {
                warn!(kind = %k, project = %event.project_id, id = %ack.id(), "unknown event kind; dropping");
                Disposition::Dropped
            }
            Err(e) => {
                counter!("process_failures_total", 1u64, "reason" => e.label());
                error!(
                    kind = %event.kind,
                    project = %event.project_id,
                    deployment = %event.deployment_id,
                    request_id = %event.request_id,
                    deliveries,
                    error = %e,
                    "event processing failed"
                );
                self.report(StatusEvent::for_event(StatusKind::Failed, &event).with_reason(e.to_string())).await;
                match self.cfg.max_deliveries {
                    Some(max) if deliveries >= max => {
                        warn!(project = %event.project_id, id = %ack.id(), deliveries, "delivery limit reached; acking as permanent failure");
                        counter!("process_poisoned_total", 1u64);
                        Disposition::Poisoned
                    }
                    _ => Disposition::Pending,
                }
            }
        };

        if disposition != Disposition::Pending {
            if let Err(e) = ack.ack().await {
                warn!(project = %event.project_id, id = %ack.id(), error = %e, "ack failed; entry will be redelivered");
            }
        }
        counter!("events_processed_total", 1u64, "kind" => event.kind.as_str().to_string());
        disposition
    }

    async fn dispatch(&self, ev: &StreamEvent) -> Result<Outcome, HandlerError> {
        match &ev.kind {
            EventKind::Created => self.on_created(ev).await,
            EventKind::Deleted => self.on_deleted(ev).await,
            EventKind::Requested => self.on_requested(ev).await,
            EventKind::Other(k) => Err(HandlerError::UnknownKind(k.clone())),
        }
    }

    async fn admit(&self) -> Option<Outcome> {
        match self.admission.check().await {
            Admission::Admit { .. } => None,
            Admission::Reject { usage } => Some(Outcome::Rejected { usage }),
        }
    }

    async fn workload(&self, project_id: &str, deployment_id: &str, pt: ProjectType) -> Result<Workload, HandlerError> {
        let manifest = self
            .projects
            .container_manifest(project_id, deployment_id, ManifestKind::for_project(pt))
            .await
            .map_err(HandlerError::Projects)?;
        Ok(Workload {
            project_id: project_id.to_string(),
            deployment_id: deployment_id.to_string(),
            project_type: pt,
            manifest,
        })
    }

    async fn start(&self, w: &Workload, fresh: bool) -> Result<(), HandlerError> {
        if fresh {
            self.resources.create(w).await?;
        } else {
            self.resources.recreate_if_missing(w).await?;
        }
        if w.project_type == ProjectType::Dynamic {
            self.resources.expose(w).await?;
        }
        Ok(())
    }

    fn record_starting(&self, w: &Workload) -> Result<(), HandlerError> {
        let rec = WorkloadRecord {
            project_id: w.project_id.clone(),
            deployment_id: w.deployment_id.clone(),
            project_type: w.project_type,
            status: StatusKind::Starting,
            namespace: self.resources.namespace_for(w.project_type).to_string(),
            last_ingressed_at: now_ts(),
        };
        self.store.upsert(&rec).map_err(HandlerError::Store)
    }

    async fn on_created(&self, ev: &StreamEvent) -> Result<Outcome, HandlerError> {
        if let Some(rejected) = self.admit().await {
            return Ok(rejected);
        }
        let pt = ev.project_type.ok_or_else(|| HandlerError::MissingProjectType(ev.project_id.clone()))?;
        let w = self.workload(&ev.project_id, &ev.deployment_id, pt).await?;
        self.start(&w, true).await?;
        self.record_starting(&w)?;
        self.report(StatusEvent::for_event(StatusKind::Starting, ev)).await;
        Ok(Outcome::Applied)
    }

    async fn on_deleted(&self, ev: &StreamEvent) -> Result<Outcome, HandlerError> {
        let types: &[ProjectType] = match ev.project_type {
            Some(ProjectType::Static) => &[ProjectType::Static],
            Some(ProjectType::Dynamic) => &[ProjectType::Dynamic],
            None => &[ProjectType::Static, ProjectType::Dynamic],
        };
        for pt in types {
            self.resources.delete(&ev.project_id, *pt).await?;
        }
        let purged = self.store.delete_by_deployment(&ev.deployment_id).map_err(HandlerError::Store)?;
        debug!(project = %ev.project_id, deployment = %ev.deployment_id, purged, "workload records purged");
        self.report(StatusEvent::for_event(StatusKind::Stopped, ev)).await;
        Ok(Outcome::Applied)
    }

    async fn on_requested(&self, ev: &StreamEvent) -> Result<Outcome, HandlerError> {
        if let Some(rejected) = self.admit().await {
            return Ok(rejected);
        }
        let latest = self
            .projects
            .latest_deployment(&ev.project_id)
            .await
            .map_err(HandlerError::Projects)?
            .ok_or_else(|| HandlerError::NoDeployments(ev.project_id.clone()))?;
        let w = self.workload(&latest.project_id, &latest.deployment_id, latest.project_type).await?;
        self.start(&w, false).await?;
        let touched = self.store.touch_ingress(&w.project_id, now_ts()).map_err(HandlerError::Store)?;
        if !touched {
            self.record_starting(&w)?;
        }
        let status = StatusEvent::new(StatusKind::Starting, &w.project_id, &w.deployment_id, &ev.request_id);
        self.report(status).await;
        Ok(Outcome::Applied)
    }

    async fn report(&self, status: StatusEvent) {
        if let Err(e) = self.status.publish(&status).await {
            warn!(project = %status.project_id, status = %status.kind, error = %e, "status publish failed");
        }
    }
}
