use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use keel_core::{EventKind, ProjectType, StreamEvent};
use keel_kubehub::{AdmissionController, KubeNodeMemory, MemorySampler};
use keel_persist::{SqliteStore, WorkloadStore};
use keel_stream::{publish, RedisBroker, RedisParams, StreamBroker};
use tracing::info;

mod daemon;

#[derive(Parser, Debug)]
#[command(name = "keeld", version, about = "Keel deployment orchestrator")]
struct Cli {
    /// Output format for operator commands
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(flatten)]
    redis: RedisArgs,

    #[command(flatten)]
    topics: TopicArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug, Clone)]
struct RedisArgs {
    #[arg(long, env = "KEEL_REDIS_HOST", default_value = "127.0.0.1", global = true)]
    redis_host: String,
    #[arg(long, env = "KEEL_REDIS_PORT", default_value_t = 6379, global = true)]
    redis_port: u16,
    #[arg(long, env = "KEEL_REDIS_USERNAME", global = true)]
    redis_username: Option<String>,
    #[arg(long, env = "KEEL_REDIS_PASSWORD", hide_env_values = true, global = true)]
    redis_password: Option<String>,
    #[arg(long, env = "KEEL_REDIS_DB", default_value_t = 0, global = true)]
    redis_db: i64,
}

impl RedisArgs {
    fn params(&self) -> RedisParams {
        RedisParams {
            host: self.redis_host.clone(),
            port: self.redis_port,
            username: self.redis_username.clone(),
            password: self.redis_password.clone(),
            db: self.redis_db,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct TopicArgs {
    #[arg(long, env = "KEEL_DEPLOYMENT_TOPIC", default_value = "deployment-events", global = true)]
    deployment_topic: String,
    #[arg(long, env = "KEEL_STATUS_TOPIC", default_value = "container-status", global = true)]
    status_topic: String,
    #[arg(long, env = "KEEL_PROJECT_TOPIC", default_value = "project-events", global = true)]
    project_topic: String,
    #[arg(long, env = "KEEL_GROUP", default_value = "keel-orchestrator", global = true)]
    group: String,
    /// Consumer name within the group (default: $HOSTNAME)
    #[arg(long, env = "KEEL_CONSUMER", global = true)]
    consumer: Option<String>,
}

impl TopicArgs {
    fn consumer_name(&self) -> String {
        self.consumer
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "keel-0".to_string())
    }
}

#[derive(Args, Debug, Clone)]
struct KubeArgs {
    /// Use the pod's service account instead of the local kubeconfig
    #[arg(long, env = "KEEL_IN_CLUSTER", action = ArgAction::SetTrue)]
    in_cluster: bool,
    /// Free-tier node workloads are pinned to and sampled on
    #[arg(long, env = "KEEL_NODE_NAME")]
    node_name: String,
    #[arg(long, env = "KEEL_MEMORY_THRESHOLD", default_value_t = keel_kubehub::DEFAULT_THRESHOLD_PERCENT)]
    memory_threshold: f64,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    #[command(flatten)]
    kube: KubeArgs,
    #[arg(long, env = "KEEL_STATIC_NAMESPACE", default_value = "keel-static")]
    static_namespace: String,
    #[arg(long, env = "KEEL_DYNAMIC_NAMESPACE", default_value = "keel-dynamic")]
    dynamic_namespace: String,
    /// Image pull secret attached to every workload
    #[arg(long, env = "KEEL_PULL_SECRET")]
    pull_secret: Option<String>,
    #[arg(long, env = "KEEL_POLL_INTERVAL_MS", default_value_t = 1000)]
    poll_interval_ms: u64,
    /// Give up waiting for a pod to terminate after this many polls (default: never)
    #[arg(long, env = "KEEL_MAX_POLLS")]
    max_polls: Option<u32>,
    #[arg(long, env = "KEEL_BACKOFF_BASE_MS", default_value_t = 1000)]
    backoff_base_ms: u64,
    #[arg(long, env = "KEEL_BACKOFF_MAX_MS", default_value_t = 10_000)]
    backoff_max_ms: u64,
    /// created-wins | latest-wins
    #[arg(long, env = "KEEL_COLLAPSE_POLICY", default_value = "created-wins")]
    collapse_policy: String,
    /// Ack a failing event after this many deliveries (default: retry forever)
    #[arg(long, env = "KEEL_MAX_DELIVERIES")]
    max_deliveries: Option<u64>,
    #[arg(long, env = "KEEL_PROJECTS_URL", default_value = "http://localhost:8080")]
    projects_url: String,
    #[arg(long, env = "KEEL_DB_PATH")]
    db_path: Option<String>,
    /// Watch managed pods and publish RUNNING/STOPPED/FAILED
    #[arg(long, env = "KEEL_WATCH_PHASES", action = ArgAction::SetTrue)]
    watch_phases: bool,
    /// Run the idle sweeper every N seconds (default: disabled)
    #[arg(long, env = "KEEL_SWEEP_INTERVAL_SECS")]
    sweep_interval_secs: Option<u64>,
    #[arg(long, env = "KEEL_IDLE_AFTER_SECS", default_value_t = 1800)]
    idle_after_secs: u64,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the orchestrator
    Run(RunArgs),
    /// Publish a deployment event by hand
    Publish {
        /// CREATED | DELETED | REQUESTED
        kind: String,
        project_id: String,
        #[arg(long, default_value = "")]
        deployment: String,
        /// STATIC | DYNAMIC
        #[arg(long = "project-type")]
        project_type: Option<String>,
        #[arg(long, default_value = "")]
        commit: String,
        #[arg(long = "request-id")]
        request_id: Option<String>,
    },
    /// Run one idle sweep pass
    Sweep {
        #[arg(long, env = "KEEL_DB_PATH")]
        db_path: Option<String>,
        #[arg(long, env = "KEEL_IDLE_AFTER_SECS", default_value_t = 1800)]
        idle_after_secs: u64,
    },
    /// Print the node memory sample and the admission verdict
    Pressure(KubeArgs),
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

fn open_store(path: Option<&str>) -> Result<SqliteStore> {
    match path {
        Some(p) => SqliteStore::open(p),
        None => SqliteStore::open_default(),
    }
}

async fn connect_broker(redis: &RedisArgs) -> Result<Arc<dyn StreamBroker>> {
    let params = redis.params();
    let broker = RedisBroker::connect(&params)
        .await
        .with_context(|| format!("connecting to redis at {}:{}", params.host, params.port))?;
    Ok(Arc::new(broker))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => daemon::run(&cli.redis, &cli.topics, args).await?,
        Commands::Publish { kind, project_id, deployment, project_type, commit, request_id } => {
            let project_type = project_type.map(|s| ProjectType::from_str(&s.to_uppercase())).transpose()?;
            let ev = StreamEvent {
                kind: EventKind::parse(&kind.to_uppercase()),
                project_id,
                deployment_id: deployment,
                commit_hash: commit,
                project_type,
                request_id: request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            };
            let broker = connect_broker(&cli.redis).await?;
            let id = publish(broker.as_ref(), &cli.topics.deployment_topic, &ev).await?;
            info!(id = %id, kind = %ev.kind, project = %ev.project_id, "event published");
            match cli.output {
                Output::Human => println!("{} {} {}", id, ev.kind, ev.project_id),
                Output::Json => println!("{}", serde_json::json!({ "id": id, "event": ev })),
            }
        }
        Commands::Sweep { db_path, idle_after_secs } => {
            let store: Arc<dyn WorkloadStore> = Arc::new(open_store(db_path.as_deref())?);
            let broker = connect_broker(&cli.redis).await?;
            let sweeper = keel_processor::IdleSweeper::new(
                store,
                broker,
                &cli.topics.deployment_topic,
                Duration::from_secs(idle_after_secs),
            );
            let n = sweeper.sweep_once().await?;
            match cli.output {
                Output::Human => println!("{} idle workload(s) scheduled for deletion", n),
                Output::Json => println!("{}", serde_json::json!({ "deleted": n })),
            }
        }
        Commands::Pressure(kube) => {
            let client = keel_kubehub::connect(kube.in_cluster).await?;
            let sampler = KubeNodeMemory::new(client.clone(), kube.node_name.clone());
            let sample = sampler.sample().await?;
            let verdict = AdmissionController::new(Box::new(KubeNodeMemory::new(client, kube.node_name.clone())))
                .with_threshold(kube.memory_threshold)
                .check()
                .await;
            match cli.output {
                Output::Human => println!(
                    "{}: {} / {} bytes ({:.1}%) {}",
                    kube.node_name,
                    sample.used_bytes,
                    sample.total_bytes,
                    sample.usage_percent(),
                    if verdict.admitted() { "admit" } else { "reject" }
                ),
                Output::Json => println!(
                    "{}",
                    serde_json::json!({
                        "node": kube.node_name,
                        "sample": sample,
                        "usagePercent": sample.usage_percent(),
                        "admitted": verdict.admitted(),
                    })
                ),
            }
        }
    }
    Ok(())
}
