//! ClusterClient trait for mocking
//!
//! This trait abstracts the handful of Kubernetes API calls the env-sync
//! controller makes. `KubeClusterClient` implements it against a live cluster;
//! tests use `MockClusterClient` (feature `test-util`).

use crate::error::ClusterError;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;

/// Trait for cluster API operations
///
/// Every call is a round trip to the authoritative store, never a cache read.
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ClusterClientTrait: Send + Sync {
    // ConfigMaps
    /// Fetch one ConfigMap; `ClusterError::NotFound` if it does not exist
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, ClusterError>;
    /// List every ConfigMap in a namespace
    async fn list_config_maps(&self, namespace: &str) -> Result<Vec<ConfigMap>, ClusterError>;

    // Deployments
    /// List every Deployment in a namespace
    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>, ClusterError>;
    /// Fetch one Deployment; `ClusterError::NotFound` if it does not exist
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, ClusterError>;

    /// Replace a Deployment.
    ///
    /// The object's `metadata.resourceVersion` is sent along, so the API server
    /// rejects the write with `ClusterError::Conflict` if someone else updated
    /// the Deployment after it was read.
    async fn update_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ClusterError>;
}
