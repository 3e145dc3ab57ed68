//! `keeld run`: wires the broker, cluster, store and collaborators into the task set.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use keel_api::{HttpProjects, ProjectsApi};
use keel_kubehub::{AdmissionController, KubeNodeMemory};
use keel_ops::{KubeWorkloadApi, ManagerConfig, PodPlacement, ResourceManager};
use keel_persist::WorkloadStore;
use keel_processor::{DeploymentIngest, IdleSweeper, PhaseReporter, Processor, ProcessorConfig, ProjectIngest};
use keel_store::{CollapsePolicy, SharedQueue};
use keel_stream::{StatusProducer, StreamConsumer};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{connect_broker, open_store, RedisArgs, RunArgs, TopicArgs};

const PHASE_CHANNEL_CAP: usize = 256;

pub async fn run(redis: &RedisArgs, topics: &TopicArgs, args: RunArgs) -> Result<()> {
    let policy: CollapsePolicy = args.collapse_policy.parse()?;
    let consumer_name = topics.consumer_name();
    info!(
        consumer = %consumer_name,
        group = %topics.group,
        node = %args.kube.node_name,
        policy = ?policy,
        "keeld starting"
    );

    let broker = connect_broker(redis).await?;
    let client = keel_kubehub::connect(args.kube.in_cluster).await?;

    let manager_cfg = ManagerConfig {
        static_namespace: args.static_namespace.clone(),
        dynamic_namespace: args.dynamic_namespace.clone(),
        placement: PodPlacement { node_name: Some(args.kube.node_name.clone()), pull_secret: args.pull_secret.clone() },
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        max_polls: args.max_polls,
    };
    let resources = Arc::new(ResourceManager::new(Arc::new(KubeWorkloadApi::new(client.clone())), manager_cfg));
    resources.ensure_namespaces().await.context("ensuring project namespaces")?;

    let store: Arc<dyn WorkloadStore> = Arc::new(open_store(args.db_path.as_deref())?);
    let projects: Arc<dyn ProjectsApi> = Arc::new(HttpProjects::new(&args.projects_url)?);
    let admission = AdmissionController::new(Box::new(KubeNodeMemory::new(client.clone(), args.kube.node_name.clone())))
        .with_threshold(args.kube.memory_threshold);
    let status = StatusProducer::new(broker.clone(), &topics.status_topic);
    let queue = SharedQueue::new(policy);

    let deployments = StreamConsumer::new(broker.clone(), &topics.deployment_topic, &topics.group, &consumer_name);
    let project_events = StreamConsumer::new(broker.clone(), &topics.project_topic, &topics.group, &consumer_name);
    deployments.initialize_group().await?;
    project_events.initialize_group().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background: Vec<JoinHandle<()>> = Vec::new();

    background.push(tokio::spawn({
        let handler = DeploymentIngest::new(queue.clone());
        async move {
            deployments.read_backlog(&handler).await;
            deployments.read_live(&handler).await;
        }
    }));
    background.push(tokio::spawn({
        let handler = ProjectIngest::new(queue.clone());
        async move {
            project_events.read_backlog(&handler).await;
            project_events.read_live(&handler).await;
        }
    }));

    if args.watch_phases {
        let (tx, rx) = mpsc::channel(PHASE_CHANNEL_CAP);
        for ns in [args.static_namespace.clone(), args.dynamic_namespace.clone()] {
            let client = client.clone();
            let tx = tx.clone();
            background.push(tokio::spawn(async move {
                if let Err(e) = keel_kubehub::watch_workloads(client, &ns, tx).await {
                    error!(ns = %ns, error = ?e, "workload watcher failed");
                }
            }));
        }
        let reporter = PhaseReporter::new(store.clone(), status.clone());
        background.push(tokio::spawn(async move { reporter.run(rx).await }));
    }

    let sweeper_handle = args.sweep_interval_secs.map(|secs| {
        let sweeper = IdleSweeper::new(
            store.clone(),
            broker.clone(),
            &topics.deployment_topic,
            Duration::from_secs(args.idle_after_secs),
        );
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { sweeper.run(Duration::from_secs(secs.max(1)), rx).await })
    });

    let processor = Arc::new(Processor::new(
        queue,
        admission,
        resources,
        projects,
        store,
        status,
        ProcessorConfig {
            backoff_base: Duration::from_millis(args.backoff_base_ms),
            backoff_max: Duration::from_millis(args.backoff_max_ms),
            max_deliveries: args.max_deliveries,
        },
    ));
    let processor_handle = tokio::spawn({
        let processor = processor.clone();
        async move { processor.run(shutdown_rx).await }
    });

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Ctrl-C received; shutting down");
    let _ = shutdown_tx.send(true);
    for h in &background {
        h.abort();
    }
    // The processor finishes the entry in flight; unacked entries come back on the next start.
    if tokio::time::timeout(Duration::from_secs(30), processor_handle).await.is_err() {
        warn!("processor did not stop within 30s");
    }
    if let Some(h) = sweeper_handle {
        let _ = h.await;
    }
    info!("keeld stopped");
    Ok(())
}
