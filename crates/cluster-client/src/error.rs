//! Cluster client errors

use thiserror::Error;

/// Errors that can occur when talking to the Kubernetes API
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Requested object does not exist (HTTP 404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency conflict: the object changed since it was read (HTTP 409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Any other Kubernetes client error (transport, auth, 5xx, ...)
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Error that did not come from the kube client (mock failures, malformed objects)
    #[error("API error: {0}")]
    Api(String),
}

impl ClusterError {
    /// Map a kube error onto the taxonomy the controller branches on.
    pub fn from_kube(err: kube::Error, what: &str) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound(what.to_string()),
            kube::Error::Api(ae) if ae.code == 409 => {
                ClusterError::Conflict(format!("{}: {}", what, ae.message))
            }
            other => ClusterError::Kube(other),
        }
    }

    /// The object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    /// The write lost an optimistic-concurrency race
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict(_))
    }
}
