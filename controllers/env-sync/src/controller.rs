//! Main controller implementation.
//!
//! This module contains the `Controller` struct that owns the cluster
//! connection and wires the ConfigMap subscription, the event funnel, the
//! work queue and the reconcile workers together.

use crate::config::Config;
use crate::env_from;
use crate::error::ControllerError;
use crate::key::ReconcileKey;
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use crate::watcher::{self, cached_keys, run_funnel, ConfigMapEvent, Subscription};
use cluster_client::{ClusterClientTrait, KubeClusterClient};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client};
use kube_runtime::reflector::Store;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Main controller for ConfigMap → Deployment env wiring.
pub struct Controller {
    config: Config,
    kube_client: Client,
    cluster: Arc<dyn ClusterClientTrait>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a new controller instance connected to the cluster.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing env-sync controller");

        let kube_client = connect(config.kubeconfig.as_deref()).await?;
        let cluster: Arc<dyn ClusterClientTrait> = Arc::new(KubeClusterClient::new(kube_client.clone()));

        Ok(Self {
            config,
            kube_client,
            cluster,
        })
    }

    /// Runs the controller until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<(), ControllerError> {
        self.run_until(shutdown_signal()).await
    }

    /// Runs the controller until `shutdown` resolves.
    ///
    /// In-flight reconciliations are allowed to finish before this returns.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ControllerError>
    where
        F: Future<Output = ()>,
    {
        let namespace = self.config.namespace.clone();
        log_inventory(self.cluster.as_ref(), &namespace).await;

        let api: Api<ConfigMap> = Api::namespaced(self.kube_client.clone(), &namespace);
        let (subscription, events) = watcher::subscribe(api);
        run_pipeline(Arc::clone(&self.cluster), &self.config, subscription, events, shutdown).await
    }
}

/// Drives an established subscription through the funnel, queue and workers
/// until `shutdown` resolves.
///
/// Shutdown order: the watch is cancelled, the resync ticker stopped, the
/// funnel flushed into the queue, the queue drained of in-flight keys, and
/// finally the workers joined.
pub async fn run_pipeline<F>(
    cluster: Arc<dyn ClusterClientTrait>,
    config: &Config,
    subscription: Subscription,
    events: mpsc::Receiver<ConfigMapEvent>,
    shutdown: F,
) -> Result<(), ControllerError>
where
    F: Future<Output = ()>,
{
    let namespace = config.namespace.as_str();
    let queue: WorkQueue<ReconcileKey> = WorkQueue::new();
    let funnel = tokio::spawn(run_funnel(events, queue.clone()));

    tokio::pin!(shutdown);

    info!("Waiting for ConfigMap cache to sync in {}", namespace);
    let synced = tokio::select! {
        synced = subscription.wait_for_initial_sync() => Some(synced),
        _ = &mut shutdown => None,
    };
    if synced != Some(true) {
        subscription.cancel().await;
        queue.shutdown();
        let _ = funnel.await;
        return match synced {
            None => {
                info!("Shutdown requested before cache sync");
                Ok(())
            }
            Some(_) => {
                error!("ConfigMap cache did not sync");
                Err(ControllerError::Watch("ConfigMap cache did not sync".to_string()))
            }
        };
    }
    info!("ConfigMap cache synced ({} objects)", subscription.keys().len());

    let reconciler = Arc::new(Reconciler::new(Arc::clone(&cluster)).with_max_requeues(config.max_requeues));
    let workers = spawn_workers(reconciler, queue.clone(), config.workers);
    let resync = config.resync_period.map(|period| {
        spawn_resync(
            subscription.store(),
            Arc::clone(&cluster),
            namespace.to_string(),
            queue.clone(),
            period,
        )
    });

    info!("env-sync controller running in namespace {}", namespace);
    shutdown.await;
    info!("Shutting down env-sync controller, {} keys still queued", queue.len());

    subscription.cancel().await;
    if let Some(resync) = resync {
        resync.abort();
    }
    if let Err(e) = funnel.await {
        warn!("Event funnel ended abnormally: {}", e);
    }
    queue.shutdown_with_drain().await;
    for worker in workers {
        if let Err(e) = worker.await {
            warn!("Worker ended abnormally: {}", e);
        }
    }

    info!("env-sync controller stopped");
    Ok(())
}

/// Builds a kube client from the kubeconfig file, falling back to the
/// in-cluster service account.
async fn connect(kubeconfig: Option<&Path>) -> Result<Client, ControllerError> {
    if let Some(path) = kubeconfig {
        match Kubeconfig::read_from(path) {
            Ok(kc) => match kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default()).await {
                Ok(config) => {
                    info!("Using kubeconfig {}", path.display());
                    return Ok(Client::try_from(config)?);
                }
                Err(e) => warn!("Kubeconfig {} unusable ({}), trying in-cluster config", path.display(), e),
            },
            Err(e) => warn!("Cannot read kubeconfig {} ({}), trying in-cluster config", path.display(), e),
        }
    }

    let config = kube::Config::incluster()
        .map_err(|e| ControllerError::KubeConfig(format!("no usable kubeconfig or in-cluster config: {}", e)))?;
    info!("Using in-cluster config");
    Ok(Client::try_from(config)?)
}

/// Logs the Deployments and ConfigMaps present at startup.
async fn log_inventory(cluster: &dyn ClusterClientTrait, namespace: &str) {
    match cluster.list_deployments(namespace).await {
        Ok(deployments) => {
            info!("{} Deployments in {}", deployments.len(), namespace);
            for d in &deployments {
                info!("  deployment {}", d.metadata.name.as_deref().unwrap_or("<unknown>"));
            }
        }
        Err(e) => warn!("Failed to list Deployments in {}: {}", namespace, e),
    }
    match cluster.list_config_maps(namespace).await {
        Ok(config_maps) => {
            info!("{} ConfigMaps in {}", config_maps.len(), namespace);
            for cm in &config_maps {
                info!("  configmap {}", cm.metadata.name.as_deref().unwrap_or("<unknown>"));
            }
        }
        Err(e) => warn!("Failed to list ConfigMaps in {}: {}", namespace, e),
    }
}

/// Starts `count` workers that reconcile keys until the queue shuts down.
pub fn spawn_workers(
    reconciler: Arc<Reconciler>,
    queue: WorkQueue<ReconcileKey>,
    count: usize,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|id| {
            let reconciler = Arc::clone(&reconciler);
            let queue = queue.clone();
            tokio::spawn(async move {
                debug!("Worker {} started", id);
                while reconciler.process_next(&queue).await {}
                debug!("Worker {} stopped", id);
            })
        })
        .collect()
}

/// Re-enqueues, each `period`, every cached ConfigMap and every ConfigMap a
/// Deployment in `namespace` still references.
///
/// Catches Deployments created after their ConfigMap, and keys whose earlier
/// passes were dropped. Referenced names cover dropped removals: a deleted
/// ConfigMap is no longer cached, but the stale reference still names it.
pub fn spawn_resync(
    store: Store<ConfigMap>,
    cluster: Arc<dyn ClusterClientTrait>,
    namespace: String,
    queue: WorkQueue<ReconcileKey>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately; the initial listing already enqueued everything
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let mut keys = cached_keys(&store);
            keys.extend(referenced_keys(cluster.as_ref(), &namespace).await);
            keys.sort();
            keys.dedup();
            debug!("Resync: enqueueing {} ConfigMaps", keys.len());
            for key in keys {
                queue.add(key);
            }
        }
    })
}

/// Keys of every ConfigMap referenced by a Deployment in `namespace`.
async fn referenced_keys(cluster: &dyn ClusterClientTrait, namespace: &str) -> Vec<ReconcileKey> {
    match cluster.list_deployments(namespace).await {
        Ok(deployments) => deployments
            .iter()
            .flat_map(env_from::referenced_config_maps)
            .map(|name| ReconcileKey::new(namespace, name))
            .collect(),
        Err(e) => {
            warn!("Resync could not list Deployments in {}: {}", namespace, e);
            Vec::new()
        }
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
