//! env-sync Controller
//!
//! Keeps Deployments wired to the ConfigMaps of their namespace:
//! - ConfigMap created: every Deployment in the namespace gets an
//!   `envFrom.configMapRef` to it (first container only)
//! - ConfigMap deleted: every such reference is removed again
//!
//! The controller is level-triggered: each pass re-reads the live state, so
//! duplicate, reordered or missed notifications converge to the same result.

mod backoff;
mod config;
mod controller;
mod env_from;
mod error;
mod key;
mod queue;
mod reconciler;
mod retry;
mod test_utils;
mod watcher;

#[cfg(test)]
mod queue_test;

use crate::config::Config;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting env-sync Controller");

    // Load configuration from environment variables
    let config = Config::from_env()?;

    info!("Configuration:");
    info!(
        "  Kubeconfig: {}",
        config
            .kubeconfig
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "in-cluster".to_string())
    );
    info!("  Namespace: {}", config.namespace);
    info!("  Workers: {}", config.workers);
    info!(
        "  Resync: {}",
        config
            .resync_period
            .map(|p| format!("{}s", p.as_secs()))
            .unwrap_or_else(|| "disabled".to_string())
    );

    // Initialize and run controller
    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
