//! kube-backed implementation of `ClusterClientTrait`.

use crate::cluster_trait::ClusterClientTrait;
use crate::error::ClusterError;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{ListParams, PostParams};
use kube::{Api, Client};
use tracing::debug;

/// Cluster API client backed by a `kube::Client`.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient")
            .field("default_namespace", &self.client.default_namespace())
            .finish()
    }
}

impl KubeClusterClient {
    /// Wrap an already-configured kube client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl ClusterClientTrait for KubeClusterClient {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, ClusterError> {
        debug!("GET configmap {}/{}", namespace, name);
        self.config_maps(namespace)
            .get(name)
            .await
            .map_err(|e| ClusterError::from_kube(e, &format!("configmap {}/{}", namespace, name)))
    }

    async fn list_config_maps(&self, namespace: &str) -> Result<Vec<ConfigMap>, ClusterError> {
        debug!("LIST configmaps in {}", namespace);
        let list = self
            .config_maps(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| ClusterError::from_kube(e, &format!("configmaps in {}", namespace)))?;
        Ok(list.items)
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>, ClusterError> {
        debug!("LIST deployments in {}", namespace);
        let list = self
            .deployments(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| ClusterError::from_kube(e, &format!("deployments in {}", namespace)))?;
        Ok(list.items)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, ClusterError> {
        debug!("GET deployment {}/{}", namespace, name);
        self.deployments(namespace)
            .get(name)
            .await
            .map_err(|e| ClusterError::from_kube(e, &format!("deployment {}/{}", namespace, name)))
    }

    async fn update_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ClusterError> {
        let name = deployment
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ClusterError::Api("deployment has no metadata.name".to_string()))?;
        debug!(
            "PUT deployment {}/{} (resourceVersion {:?})",
            namespace, name, deployment.metadata.resource_version
        );
        self.deployments(namespace)
            .replace(name, &PostParams::default(), deployment)
            .await
            .map_err(|e| ClusterError::from_kube(e, &format!("deployment {}/{}", namespace, name)))
    }
}
