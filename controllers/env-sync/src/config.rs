//! Controller configuration, loaded from environment variables.

use crate::error::ControllerError;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration of the env-sync controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Kubeconfig file; when unusable the in-cluster service account is tried
    pub kubeconfig: Option<PathBuf>,
    /// Namespace whose ConfigMaps and Deployments are managed
    pub namespace: String,
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Interval at which every cached ConfigMap is re-enqueued (`None` disables)
    pub resync_period: Option<Duration>,
    /// Failed passes tolerated per key before it is dropped (0 = unlimited)
    pub max_requeues: u32,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let kubeconfig = lookup("KUBECONFIG")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .or_else(|| lookup("HOME").map(|home| PathBuf::from(home).join(".kube").join("config")));

        let namespace = lookup("WATCH_NAMESPACE")
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| "default".to_string());

        let workers: usize = parse_or(&lookup, "ENV_SYNC_WORKERS", 1)?;
        if workers == 0 {
            return Err(ControllerError::InvalidConfig(
                "ENV_SYNC_WORKERS must be at least 1".to_string(),
            ));
        }

        let resync_seconds: u64 = parse_or(&lookup, "ENV_SYNC_RESYNC_SECONDS", 600)?;
        let resync_period = (resync_seconds > 0).then(|| Duration::from_secs(resync_seconds));

        let max_requeues = parse_or(&lookup, "ENV_SYNC_MAX_REQUEUES", 0)?;

        Ok(Self {
            kubeconfig,
            namespace,
            workers,
            resync_period,
            max_requeues,
        })
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ControllerError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e| {
            ControllerError::InvalidConfig(format!("{} must be a number, got {:?}: {}", name, raw, e))
        }),
    }
}
