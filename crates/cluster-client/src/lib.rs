//! Cluster API client for the env-sync controller
//!
//! A narrow client over the Kubernetes API covering exactly what the
//! controller needs: reading ConfigMaps, and listing, reading and replacing
//! Deployments under optimistic concurrency.
//!
//! # Example
//!
//! ```no_run
//! use cluster_client::{ClusterClientTrait, KubeClusterClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = KubeClusterClient::new(kube::Client::try_default().await?);
//!
//! match client.get_config_map("default", "app-config").await {
//!     Ok(_) => println!("present"),
//!     Err(e) if e.is_not_found() => println!("absent"),
//!     Err(e) => return Err(e.into()),
//! }
//!
//! for deployment in client.list_deployments("default").await? {
//!     println!("{:?}", deployment.metadata.name);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **`test-util`**: exposes `MockClusterClient`, an in-memory cluster with
//!   resourceVersion conflict detection and failure injection.

/// kube-backed client
pub mod client;
/// Error taxonomy
pub mod error;
/// The client trait
#[path = "trait.rs"]
pub mod cluster_trait;
/// In-memory client for tests
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::KubeClusterClient;
pub use error::ClusterError;
pub use cluster_trait::ClusterClientTrait;
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockClusterClient;
