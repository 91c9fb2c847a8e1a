//! Mock ClusterClient for unit testing
//!
//! This module provides an in-memory implementation of `ClusterClientTrait`
//! that behaves like the API server where the controller cares: every write
//! bumps `metadata.resourceVersion`, and a replace carrying a stale version is
//! rejected with `ClusterError::Conflict`. Failures and concurrent writers can
//! be injected per object.

use crate::cluster_trait::ClusterClientTrait;
use crate::error::ClusterError;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type ObjectKey = (String, String);
type Interference = Arc<dyn Fn(&mut Deployment) + Send + Sync>;

fn key(namespace: &str, name: &str) -> ObjectKey {
    (namespace.to_string(), name.to_string())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock ClusterClient for testing
///
/// Cloning shares the underlying store, so a test can keep a handle for
/// assertions while the controller owns another.
#[derive(Clone, Default)]
pub struct MockClusterClient {
    pub(crate) config_maps: Arc<Mutex<BTreeMap<ObjectKey, ConfigMap>>>,
    pub(crate) deployments: Arc<Mutex<BTreeMap<ObjectKey, Deployment>>>,
    // Cluster-wide resourceVersion counter, like etcd's revision
    pub(crate) revision: Arc<Mutex<u64>>,
    // Injected behaviour
    config_map_get_failure: Arc<Mutex<Option<String>>>,
    deployment_list_failure: Arc<Mutex<Option<String>>>,
    update_failures: Arc<Mutex<HashMap<ObjectKey, String>>>,
    interference: Arc<Mutex<HashMap<ObjectKey, (u32, Interference)>>>,
    // Call counters
    update_calls: Arc<AtomicUsize>,
    get_deployment_calls: Arc<AtomicUsize>,
}

impl std::fmt::Debug for MockClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClusterClient")
            .field("config_maps", &lock(&self.config_maps).keys().collect::<Vec<_>>())
            .field("deployments", &lock(&self.deployments).keys().collect::<Vec<_>>())
            .field("update_calls", &self.update_calls())
            .finish_non_exhaustive()
    }
}

impl MockClusterClient {
    /// Create an empty mock cluster
    pub fn new() -> Self {
        Self::default()
    }

    fn next_revision(&self) -> String {
        let mut rev = lock(&self.revision);
        *rev += 1;
        rev.to_string()
    }

    /// Add (or recreate) a ConfigMap (for test setup)
    pub fn add_config_map(&self, namespace: &str, name: &str) {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                resource_version: Some(self.next_revision()),
                ..Default::default()
            },
            ..Default::default()
        };
        lock(&self.config_maps).insert(key(namespace, name), cm);
    }

    /// Delete a ConfigMap (for test setup)
    pub fn delete_config_map(&self, namespace: &str, name: &str) {
        lock(&self.config_maps).remove(&key(namespace, name));
    }

    /// Store a Deployment as-is, assigning it a fresh resourceVersion (for test setup)
    ///
    /// The namespace is taken from `metadata.namespace`, defaulting to `default`.
    pub fn add_deployment(&self, mut deployment: Deployment) {
        let namespace = deployment
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let name = deployment.metadata.name.clone().unwrap_or_default();
        deployment.metadata.namespace = Some(namespace.clone());
        deployment.metadata.resource_version = Some(self.next_revision());
        lock(&self.deployments).insert(key(&namespace, &name), deployment);
    }

    /// Current stored copy of a Deployment (for assertions)
    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        lock(&self.deployments).get(&key(namespace, name)).cloned()
    }

    /// Make every `get_config_map` call fail with a non-NotFound error
    pub fn fail_config_map_gets(&self, message: impl Into<String>) {
        *lock(&self.config_map_get_failure) = Some(message.into());
    }

    /// Make every `list_deployments` call fail
    pub fn fail_deployment_lists(&self, message: impl Into<String>) {
        *lock(&self.deployment_list_failure) = Some(message.into());
    }

    /// Make every update of one Deployment fail with a non-conflict error
    pub fn fail_updates_for(&self, namespace: &str, name: &str, message: impl Into<String>) {
        lock(&self.update_failures).insert(key(namespace, name), message.into());
    }

    /// Clear all injected failures
    pub fn clear_failures(&self) {
        *lock(&self.config_map_get_failure) = None;
        *lock(&self.deployment_list_failure) = None;
        lock(&self.update_failures).clear();
    }

    /// Simulate a concurrent writer on one Deployment.
    ///
    /// For the next `times` update calls, `write` is applied to the stored copy
    /// (bumping its resourceVersion) just before the version check, so the
    /// incoming replace is stale and gets a Conflict.
    pub fn interfere_on_update<F>(&self, namespace: &str, name: &str, times: u32, write: F)
    where
        F: Fn(&mut Deployment) + Send + Sync + 'static,
    {
        lock(&self.interference).insert(key(namespace, name), (times, Arc::new(write)));
    }

    /// Number of `update_deployment` calls received, successful or not
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Number of `get_deployment` calls received
    pub fn get_deployment_calls(&self) -> usize {
        self.get_deployment_calls.load(Ordering::SeqCst)
    }

    fn interfere(&self, k: &ObjectKey) {
        let write = {
            let mut interference = lock(&self.interference);
            match interference.get_mut(k) {
                Some((remaining, write)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(Arc::clone(write))
                }
                _ => None,
            }
        };
        let Some(write) = write else { return };
        let revision = self.next_revision();
        if let Some(stored) = lock(&self.deployments).get_mut(k) {
            write(stored);
            stored.metadata.resource_version = Some(revision);
        }
    }
}

#[async_trait::async_trait]
impl ClusterClientTrait for MockClusterClient {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, ClusterError> {
        if let Some(message) = lock(&self.config_map_get_failure).clone() {
            return Err(ClusterError::Api(message));
        }
        lock(&self.config_maps)
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("configmap {}/{}", namespace, name)))
    }

    async fn list_config_maps(&self, namespace: &str) -> Result<Vec<ConfigMap>, ClusterError> {
        Ok(lock(&self.config_maps)
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, cm)| cm.clone())
            .collect())
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>, ClusterError> {
        if let Some(message) = lock(&self.deployment_list_failure).clone() {
            return Err(ClusterError::Api(message));
        }
        Ok(lock(&self.deployments)
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, ClusterError> {
        self.get_deployment_calls.fetch_add(1, Ordering::SeqCst);
        self.deployment(namespace, name)
            .ok_or_else(|| ClusterError::NotFound(format!("deployment {}/{}", namespace, name)))
    }

    async fn update_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ClusterError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let name = deployment
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClusterError::Api("deployment has no metadata.name".to_string()))?;
        let k = key(namespace, &name);

        if let Some(message) = lock(&self.update_failures).get(&k).cloned() {
            return Err(ClusterError::Api(message));
        }
        self.interfere(&k);

        let revision = self.next_revision();
        let mut deployments = lock(&self.deployments);
        let stored = deployments
            .get_mut(&k)
            .ok_or_else(|| ClusterError::NotFound(format!("deployment {}/{}", namespace, name)))?;

        if let Some(incoming) = &deployment.metadata.resource_version {
            if stored.metadata.resource_version.as_ref() != Some(incoming) {
                return Err(ClusterError::Conflict(format!(
                    "deployment {}/{}: resourceVersion {} is stale (stored {:?})",
                    namespace, name, incoming, stored.metadata.resource_version
                )));
            }
        }

        let mut updated = deployment.clone();
        updated.metadata.namespace = Some(namespace.to_string());
        updated.metadata.resource_version = Some(revision);
        *stored = updated.clone();
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(namespace: &str, name: &str) -> Deployment {
        serde_json::from_value(json!({
            "metadata": { "name": name, "namespace": namespace },
            "spec": {
                "selector": { "matchLabels": { "app": name } },
                "template": {
                    "metadata": { "labels": { "app": name } },
                    "spec": { "containers": [{ "name": "app", "image": "nginx" }] }
                }
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_get_config_map_not_found() {
        let client = MockClusterClient::new();
        let err = client.get_config_map("ns1", "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_bumps_resource_version() {
        let client = MockClusterClient::new();
        client.add_deployment(deployment("ns1", "svc-a"));

        let fetched = client.get_deployment("ns1", "svc-a").await.unwrap();
        let updated = client.update_deployment("ns1", &fetched).await.unwrap();

        assert_ne!(fetched.metadata.resource_version, updated.metadata.resource_version);
        assert_eq!(client.update_calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let client = MockClusterClient::new();
        client.add_deployment(deployment("ns1", "svc-a"));

        let first = client.get_deployment("ns1", "svc-a").await.unwrap();
        let second = first.clone();
        client.update_deployment("ns1", &first).await.unwrap();

        let err = client.update_deployment("ns1", &second).await.unwrap_err();
        assert!(err.is_conflict(), "expected conflict, got {err}");
    }

    #[tokio::test]
    async fn test_interference_applies_foreign_write_then_conflicts() {
        let client = MockClusterClient::new();
        client.add_deployment(deployment("ns1", "svc-a"));
        client.interfere_on_update("ns1", "svc-a", 1, |d| {
            d.metadata.labels = Some([("touched".to_string(), "yes".to_string())].into());
        });

        let fetched = client.get_deployment("ns1", "svc-a").await.unwrap();
        assert!(client.update_deployment("ns1", &fetched).await.unwrap_err().is_conflict());

        let refetched = client.get_deployment("ns1", "svc-a").await.unwrap();
        assert!(refetched.metadata.labels.is_some());
        client.update_deployment("ns1", &refetched).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_is_namespace_scoped() {
        let client = MockClusterClient::new();
        client.add_deployment(deployment("ns1", "svc-a"));
        client.add_deployment(deployment("ns2", "svc-b"));
        client.add_config_map("ns1", "app-config");

        assert_eq!(client.list_deployments("ns1").await.unwrap().len(), 1);
        assert_eq!(client.list_config_maps("ns2").await.unwrap().len(), 0);
    }

    #[test]
    fn test_debug_lists_stored_objects() {
        let client = MockClusterClient::new();
        client.add_config_map("ns1", "app-config");
        client.add_deployment(deployment("ns1", "svc-a"));

        let debug = format!("{:?}", client);
        assert!(debug.contains("app-config"));
        assert!(debug.contains("svc-a"));
        assert!(debug.contains("update_calls: 0"));
    }
}
