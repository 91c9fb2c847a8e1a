//! Reconciliation logic for ConfigMap keys.
//!
//! For one `namespace/name` key this module decides whether the ConfigMap
//! exists and brings every Deployment in the namespace in line:
//!
//! - ConfigMap present: each Deployment references it exactly once
//!   (existing references are left alone, no duplicates are added)
//! - ConfigMap absent: no Deployment references it (all matching entries go)
//!
//! Existence is always checked against the live API, never the watch cache.

use crate::backoff::ExponentialBackoff;
use crate::env_from;
use crate::error::ControllerError;
use crate::key::ReconcileKey;
use crate::queue::WorkQueue;
use crate::retry::{mutate_deployment, MutationOutcome};
use cluster_client::ClusterClientTrait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What one sync pass did, counted per Deployment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncSummary {
    /// Deployments written
    pub updated: usize,
    /// Deployments already in the desired state
    pub unchanged: usize,
    /// Deployments deleted before they could be written
    pub gone: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Desired {
    Referenced,
    Unreferenced,
}

/// Reconciles ConfigMap references on Deployments.
pub struct Reconciler {
    client: Arc<dyn ClusterClientTrait>,
    retry_backoff: ExponentialBackoff,
    // 0 means retry forever
    max_requeues: u32,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("retry_backoff", &self.retry_backoff)
            .field("max_requeues", &self.max_requeues)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(client: Arc<dyn ClusterClientTrait>) -> Self {
        Self {
            client,
            retry_backoff: ExponentialBackoff::default(),
            max_requeues: 0,
        }
    }

    /// Backoff used between conflicting update attempts on one Deployment.
    #[allow(dead_code)] // Tests shorten the sleeps; production uses the default
    pub fn with_retry_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Give up on a key after this many consecutive failed passes (0 = never).
    pub fn with_max_requeues(mut self, max_requeues: u32) -> Self {
        self.max_requeues = max_requeues;
        self
    }

    /// Reconciles one key.
    ///
    /// This method:
    /// 1. Reads the ConfigMap from the API; NotFound selects the removal path,
    ///    any other error fails the pass before anything is written
    /// 2. Lists the Deployments in the key's namespace
    /// 3. Mutates, under conflict retry, each Deployment whose listed copy
    ///    disagrees with the desired state
    ///
    /// A failure on one Deployment does not stop the others; the pass still
    /// returns an error so the key is retried. Changes already made stay in
    /// place and are no-ops on the next pass.
    pub async fn sync(&self, key: &ReconcileKey) -> Result<SyncSummary, ControllerError> {
        let namespace = key.namespace.as_str();
        let config_map = key.name.as_str();

        let desired = match self.client.get_config_map(namespace, config_map).await {
            Ok(_) => Desired::Referenced,
            Err(e) if e.is_not_found() => {
                debug!("ConfigMap {} not found, removing references", key);
                Desired::Unreferenced
            }
            Err(e) => {
                error!("Failed to get ConfigMap {}: {}, will retry", key, e);
                return Err(e.into());
            }
        };

        let deployments = self.client.list_deployments(namespace).await?;
        debug!("{} Deployments in {}", deployments.len(), namespace);

        let mut summary = SyncSummary::default();
        let mut failures = Vec::new();

        for deployment in &deployments {
            let Some(name) = deployment.metadata.name.as_deref() else {
                warn!("Skipping Deployment without a name in {}", namespace);
                continue;
            };

            let in_sync = match desired {
                Desired::Referenced => env_from::has_config_ref(deployment, config_map),
                Desired::Unreferenced => !env_from::has_config_ref(deployment, config_map),
            };
            if in_sync {
                summary.unchanged += 1;
                continue;
            }

            let untouched = env_from::untouched_containers(deployment);
            if !untouched.is_empty() {
                debug!(
                    "Deployment {}/{}: only the first container is managed, leaving {:?}",
                    namespace, name, untouched
                );
            }

            let result = match desired {
                Desired::Referenced => {
                    mutate_deployment(
                        self.client.as_ref(),
                        self.retry_backoff.clone(),
                        namespace,
                        name,
                        |d| env_from::add_config_ref(d, config_map),
                    )
                    .await
                }
                Desired::Unreferenced => {
                    mutate_deployment(
                        self.client.as_ref(),
                        self.retry_backoff.clone(),
                        namespace,
                        name,
                        |d| env_from::remove_config_ref(d, config_map),
                    )
                    .await
                }
            };

            match result {
                Ok(MutationOutcome::Updated) => {
                    info!("Updated Deployment {}/{} ({:?} {})", namespace, name, desired, config_map);
                    summary.updated += 1;
                }
                Ok(MutationOutcome::Unchanged) => summary.unchanged += 1,
                Ok(MutationOutcome::Gone) => {
                    debug!("Deployment {}/{} disappeared, skipping", namespace, name);
                    summary.gone += 1;
                }
                Err(e) => {
                    error!("Failed to update Deployment {}/{}: {}", namespace, name, e);
                    failures.push(format!("{}: {}", name, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(summary)
        } else {
            Err(ControllerError::Reconciliation(format!(
                "{} of {} Deployments in {} not updated for {}: {}",
                failures.len(),
                deployments.len(),
                namespace,
                config_map,
                failures.join("; ")
            )))
        }
    }

    /// Takes one key off the queue and reconciles it.
    ///
    /// Success clears the key's backoff; failure requeues it with backoff
    /// (or drops it once `max_requeues` is reached). Returns `false` once the
    /// queue has shut down.
    pub async fn process_next(&self, queue: &WorkQueue<ReconcileKey>) -> bool {
        let Some(key) = queue.get().await else {
            return false;
        };

        match self.sync(&key).await {
            Ok(summary) => {
                info!(
                    "Synced {}: {} updated, {} unchanged, {} gone",
                    key, summary.updated, summary.unchanged, summary.gone
                );
                queue.forget(&key);
            }
            Err(e) => {
                let failures = queue.num_requeues(&key).saturating_add(1);
                if self.max_requeues > 0 && failures > self.max_requeues {
                    error!("Dropping {} after {} failed attempts: {}", key, failures, e);
                    queue.forget(&key);
                } else {
                    warn!("Sync of {} failed (attempt {}), requeueing: {}", key, failures, e);
                    queue.add_rate_limited(key.clone());
                }
            }
        }

        queue.done(&key);
        true
    }
}
