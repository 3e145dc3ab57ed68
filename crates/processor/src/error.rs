use keel_ops::ClusterError;
use thiserror::Error;

/// Why handling a queued event failed.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("unknown event kind {0:?}")]
    UnknownKind(String),
    #[error("project {0} has no deployments")]
    NoDeployments(String),
    #[error("event for project {0} carries no project type")]
    MissingProjectType(String),
    #[error("cluster: {0}")]
    Cluster(#[from] ClusterError),
    #[error("projects service: {0:#}")]
    Projects(anyhow::Error),
    #[error("workload store: {0:#}")]
    Store(anyhow::Error),
}

impl HandlerError {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            HandlerError::UnknownKind(_) => "unknown_kind",
            HandlerError::NoDeployments(_) => "no_deployments",
            HandlerError::MissingProjectType(_) => "missing_project_type",
            HandlerError::Cluster(_) => "cluster",
            HandlerError::Projects(_) => "projects",
            HandlerError::Store(_) => "store",
        }
    }
}
