use anyhow::Result;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Api, Client,
};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{managed_selector, DEPLOYMENT_ANNOTATION, DEPLOYMENT_LABEL, PROJECT_ANNOTATION, PROJECT_LABEL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(s: &str) -> Self {
        match s {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// Observed state of a managed pod. `deleted` is set when the pod is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadPhase {
    pub project_id: String,
    pub deployment_id: String,
    pub phase: PodPhase,
    pub reason: Option<String>,
    pub deleted: bool,
}

fn phase_from(pod: &Pod, deleted: bool) -> Option<WorkloadPhase> {
    let labels = pod.metadata.labels.as_ref()?;
    // Label values are sanitized; the raw ids are kept in annotations.
    let annotations = pod.metadata.annotations.as_ref();
    let project_id = annotations
        .and_then(|a| a.get(PROJECT_ANNOTATION))
        .or_else(|| labels.get(PROJECT_LABEL))?
        .clone();
    let deployment_id = annotations
        .and_then(|a| a.get(DEPLOYMENT_ANNOTATION))
        .or_else(|| labels.get(DEPLOYMENT_LABEL))
        .cloned()
        .unwrap_or_default();
    let status = pod.status.as_ref();
    let phase = status.and_then(|s| s.phase.as_deref()).map(PodPhase::parse).unwrap_or(PodPhase::Unknown);
    // Container-level waiting reasons (CrashLoopBackOff, ImagePullBackOff) say more than the pod phase.
    let waiting = status
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|cs| cs.iter().find_map(|c| c.state.as_ref()?.waiting.as_ref()?.reason.clone()));
    let reason = waiting.or_else(|| status.and_then(|s| s.reason.clone()));
    Some(WorkloadPhase { project_id, deployment_id, phase, reason, deleted })
}

/// List+watch managed pods in `namespace` and forward phase changes.
///
/// Watch errors (410 Gone, apiserver restarts, dropped connections) are
/// retried with backoff. Returns when the receiver is dropped or the stream ends.
pub async fn watch_workloads(client: Client, namespace: &str, tx: mpsc::Sender<WorkloadPhase>) -> Result<()> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    let cfg = watcher::Config::default().labels(&managed_selector());
    let stream = watcher::watcher(api, cfg).default_backoff();
    info!(ns = %namespace, "workload watcher started");
    forward_phases(namespace, stream, &tx).await;
    Ok(())
}

async fn forward_phases<S>(namespace: &str, stream: S, tx: &mpsc::Sender<WorkloadPhase>)
where
    S: Stream<Item = Result<Event<Pod>, watcher::Error>>,
{
    futures::pin_mut!(stream);
    while let Some(item) = stream.next().await {
        let ev = match item {
            Ok(ev) => ev,
            Err(e) => {
                counter!("watch_errors_total", 1u64, "ns" => namespace.to_string());
                warn!(ns = %namespace, error = %e, "workload watch error; retrying");
                continue;
            }
        };
        let phases: Vec<WorkloadPhase> = match ev {
            Event::Applied(p) => phase_from(&p, false).into_iter().collect(),
            Event::Deleted(p) => phase_from(&p, true).into_iter().collect(),
            Event::Restarted(list) => {
                debug!(ns = %namespace, count = list.len(), "watch restart");
                list.iter().filter_map(|p| phase_from(p, false)).collect()
            }
        };
        for p in phases {
            if tx.send(p).await.is_err() {
                debug!(ns = %namespace, "phase receiver dropped; stopping watcher");
                return;
            }
        }
    }
    warn!(ns = %namespace, "workload watcher stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateWaiting, ContainerStatus, PodStatus};
    use kube::api::ObjectMeta;
    use kube::core::ErrorResponse;
    use std::collections::BTreeMap;

    fn pod(phase: &str, waiting: Option<&str>) -> Pod {
        let mut labels = BTreeMap::new();
        labels.insert(PROJECT_LABEL.to_string(), "p1".to_string());
        labels.insert(DEPLOYMENT_LABEL.to_string(), "d1".to_string());
        Pod {
            metadata: ObjectMeta { name: Some("p1".into()), labels: Some(labels), ..Default::default() },
            status: Some(PodStatus {
                phase: Some(phase.into()),
                container_statuses: waiting.map(|r| {
                    vec![ContainerStatus {
                        name: "app".into(),
                        state: Some(ContainerState {
                            waiting: Some(ContainerStateWaiting { reason: Some(r.into()), message: None }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn running_pod_maps_labels_and_phase() {
        let p = phase_from(&pod("Running", None), false).unwrap();
        assert_eq!(p.project_id, "p1");
        assert_eq!(p.deployment_id, "d1");
        assert_eq!(p.phase, PodPhase::Running);
        assert!(!p.deleted);
    }

    #[test]
    fn waiting_reason_is_surfaced() {
        let p = phase_from(&pod("Pending", Some("ImagePullBackOff")), false).unwrap();
        assert_eq!(p.reason.as_deref(), Some("ImagePullBackOff"));
    }

    #[test]
    fn raw_ids_come_from_annotations() {
        let mut p = pod("Running", None);
        let mut annotations = BTreeMap::new();
        annotations.insert(PROJECT_ANNOTATION.to_string(), "App_1".to_string());
        annotations.insert(DEPLOYMENT_ANNOTATION.to_string(), "Dep_1".to_string());
        p.metadata.annotations = Some(annotations);
        let phase = phase_from(&p, false).unwrap();
        assert_eq!(phase.project_id, "App_1");
        assert_eq!(phase.deployment_id, "Dep_1");
    }

    #[tokio::test]
    async fn watch_errors_do_not_stop_forwarding() {
        let gone = watcher::Error::WatchError(ErrorResponse {
            status: "Failure".into(),
            message: "too old resource version".into(),
            reason: "Expired".into(),
            code: 410,
        });
        let events = futures::stream::iter(vec![
            Ok(Event::Applied(pod("Pending", None))),
            Err(gone),
            Ok(Event::Applied(pod("Running", None))),
        ]);
        let (tx, mut rx) = mpsc::channel(8);
        forward_phases("ns", events, &tx).await;
        drop(tx);
        let mut seen = Vec::new();
        while let Some(p) = rx.recv().await {
            seen.push(p.phase);
        }
        assert_eq!(seen, vec![PodPhase::Pending, PodPhase::Running]);
    }

    #[test]
    fn unlabelled_pod_is_ignored() {
        let mut p = pod("Running", None);
        p.metadata.labels = None;
        assert!(phase_from(&p, false).is_none());
    }
}
