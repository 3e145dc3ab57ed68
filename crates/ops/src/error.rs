use thiserror::Error;

/// Cluster API failure, classified by what callers branch on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("{what} still present after {polls} polls")]
    Timeout { what: String, polls: u32 },
    #[error("invalid workload: {0}")]
    Invalid(String),
    #[error("{0}")]
    Other(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool { matches!(self, ClusterError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, ClusterError::Conflict(_)) }
}

impl From<kube::Error> for ClusterError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound(ae.message),
            kube::Error::Api(ae) if ae.code == 409 => ClusterError::Conflict(ae.message),
            kube::Error::Api(ae) => ClusterError::Api { code: ae.code, message: ae.message },
            other => ClusterError::Other(other.to_string()),
        }
    }
}
