//! Controller-specific error types.
//!
//! This module defines error types specific to the env-sync controller
//! that are not covered by upstream library errors.

use cluster_client::ClusterError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the env-sync controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Cluster API error (NotFound, Conflict, transport)
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Kubernetes client construction error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Neither a kubeconfig file nor an in-cluster identity was usable
    #[error("Kubeconfig error: {0}")]
    KubeConfig(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reconciliation failed for one or more Deployments
    #[error("Reconciliation failed: {0}")]
    Reconciliation(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}
