//! Cluster Object Store Client
//!
//! Thin async access layer over the Kubernetes API used by the node manager
//! controller. Reconcilers only talk to the cluster through [`ClusterClient`],
//! which keeps them testable against the in-memory [`MockClusterClient`].
//!
//! # Example
//!
//! ```no_run
//! use cluster_client::{ClusterClient, KubeClusterClient, MachineKind};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = KubeClusterClient::new(kube::Client::try_default().await?);
//!
//! let nodes = client.list_nodes_in_group("worker").await?;
//! let machines = client
//!     .list_machines(MachineKind::Capi, "d8-cloud-instance-manager")
//!     .await?;
//! println!("{} nodes, {} machines", nodes.len(), machines.len());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod machine_kind;
#[path = "trait.rs"]
pub mod cluster_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::KubeClusterClient;
pub use cluster_trait::ClusterClient;
pub use error::ClusterError;
pub use machine_kind::MachineKind;
#[cfg(feature = "test-util")]
pub use mock::MockClusterClient;
