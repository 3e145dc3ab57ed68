use std::sync::Arc;

use anyhow::Result;
use keel_core::{StatusEvent, StatusKind};
use keel_kubehub::{PodPhase, WorkloadPhase};
use keel_persist::WorkloadStore;
use keel_stream::StatusProducer;
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Turns observed pod phases into status events and record updates.
pub struct PhaseReporter {
    store: Arc<dyn WorkloadStore>,
    status: StatusProducer,
}

fn target(phase: PodPhase) -> Option<StatusKind> {
    match phase {
        PodPhase::Running => Some(StatusKind::Running),
        PodPhase::Succeeded => Some(StatusKind::Stopped),
        PodPhase::Failed => Some(StatusKind::Failed),
        PodPhase::Pending | PodPhase::Unknown => None,
    }
}

impl PhaseReporter {
    pub fn new(store: Arc<dyn WorkloadStore>, status: StatusProducer) -> Self { Self { store, status } }

    /// Apply one observation. Returns the status published, if any.
    pub async fn apply(&self, phase: &WorkloadPhase) -> Result<Option<StatusKind>> {
        if phase.deleted {
            return Ok(None);
        }
        let Some(to) = target(phase.phase) else { return Ok(None) };
        let Some(rec) = self.store.get(&phase.project_id)? else {
            debug!(project = %phase.project_id, "phase for untracked workload");
            return Ok(None);
        };
        if rec.deployment_id != phase.deployment_id || rec.status == to {
            return Ok(None);
        }
        // Compare-and-set against the status just read; a concurrent writer wins.
        if !self.store.transition(&phase.project_id, rec.status, to)? {
            debug!(project = %phase.project_id, from = %rec.status, to = %to, "record changed underneath; phase skipped");
            return Ok(None);
        }
        let mut ev = StatusEvent::new(to, &phase.project_id, &phase.deployment_id, "");
        if let Some(r) = &phase.reason {
            ev = ev.with_reason(r.clone());
        }
        self.status.publish(&ev).await?;
        counter!("phase_transitions_total", 1u64, "status" => to.as_str());
        info!(project = %phase.project_id, deployment = %phase.deployment_id, from = %rec.status, to = %to, "workload phase changed");
        Ok(Some(to))
    }

    pub async fn run(&self, mut rx: mpsc::Receiver<WorkloadPhase>) {
        while let Some(p) = rx.recv().await {
            if let Err(e) = self.apply(&p).await {
                warn!(project = %p.project_id, error = %e, "phase report failed");
            }
        }
        debug!("phase channel closed");
    }
}
