//! Optimistic-concurrency retry around a single Deployment mutation.
//!
//! Every attempt re-reads the Deployment and re-derives the change from that
//! fresh copy before writing it back with the resourceVersion it was read at.
//! A captured snapshot is never replayed: if another writer got in between,
//! the API server answers Conflict and the next attempt starts from their
//! version.

use crate::backoff::ExponentialBackoff;
use cluster_client::{ClusterClientTrait, ClusterError};
use k8s_openapi::api::apps::v1::Deployment;
use std::future::Future;
use tracing::{debug, warn};

/// Result of one retry-wrapped Deployment mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The change was written
    Updated,
    /// The fresh copy already matched; no write was issued
    Unchanged,
    /// The Deployment no longer exists
    Gone,
}

/// Runs `op` until it returns something other than `ClusterError::Conflict`.
///
/// Sleeps between attempts according to `backoff`. Once the backoff is
/// exhausted the last Conflict is returned. Any other error is returned
/// immediately.
pub async fn retry_on_conflict<T, F, Fut>(
    mut backoff: ExponentialBackoff,
    mut op: F,
) -> Result<T, ClusterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClusterError>>,
{
    let mut attempt: u32 = 1;
    loop {
        match op().await {
            Err(e) if e.is_conflict() => match backoff.next_backoff() {
                Some(delay) => {
                    debug!("Attempt {} conflicted ({}), retrying in {:?}", attempt, e, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    warn!("Giving up after {} conflicting attempts: {}", attempt, e);
                    return Err(e);
                }
            },
            other => return other,
        }
    }
}

/// Applies `mutate` to the live Deployment `namespace/name` under conflict retry.
///
/// `mutate` must report whether it changed the object; when it does not, no
/// update is sent.
pub async fn mutate_deployment<F>(
    client: &dyn ClusterClientTrait,
    backoff: ExponentialBackoff,
    namespace: &str,
    name: &str,
    mutate: F,
) -> Result<MutationOutcome, ClusterError>
where
    F: Fn(&mut Deployment) -> bool + Sync,
{
    let mutate = &mutate;
    retry_on_conflict(backoff, move || async move {
        let mut fresh = match client.get_deployment(namespace, name).await {
            Ok(d) => d,
            Err(e) if e.is_not_found() => return Ok(MutationOutcome::Gone),
            Err(e) => return Err(e),
        };
        if !mutate(&mut fresh) {
            return Ok(MutationOutcome::Unchanged);
        }
        match client.update_deployment(namespace, &fresh).await {
            Ok(_) => Ok(MutationOutcome::Updated),
            Err(e) if e.is_not_found() => Ok(MutationOutcome::Gone),
            Err(e) => Err(e),
        }
    })
    .await
}
