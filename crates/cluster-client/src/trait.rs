//! ClusterClient trait for mocking
//!
//! Abstracts the object store so reconcilers can run against the in-memory
//! mock in unit tests. Getters return `Ok(None)` for missing objects; writes
//! surface optimistic-concurrency failures as [`ClusterError::Conflict`].

use crate::error::ClusterError;
use crate::machine_kind::MachineKind;
use crds::{Instance, NodeGroup};
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::api::DynamicObject;
use serde_json::Value;

/// Object store operations used by the node manager controller
///
/// All patches are JSON merge patches. A patch carrying
/// `metadata.resourceVersion` is applied only if the stored object still has
/// that version.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    // NodeGroups
    async fn get_node_group(&self, name: &str) -> Result<Option<NodeGroup>, ClusterError>;
    async fn list_node_groups(&self) -> Result<Vec<NodeGroup>, ClusterError>;
    /// Patches the status subresource; `patch` is `{"status": {...}}`.
    async fn patch_node_group_status(&self, name: &str, patch: &Value) -> Result<(), ClusterError>;

    // Nodes
    async fn get_node(&self, name: &str) -> Result<Option<Node>, ClusterError>;
    /// Nodes labelled `node.deckhouse.io/group=<node_group>`.
    async fn list_nodes_in_group(&self, node_group: &str) -> Result<Vec<Node>, ClusterError>;
    async fn patch_node(&self, name: &str, patch: &Value) -> Result<(), ClusterError>;

    // Secrets
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, ClusterError>;

    // Instances
    async fn get_instance(&self, name: &str) -> Result<Option<Instance>, ClusterError>;
    async fn create_instance(&self, instance: &Instance) -> Result<Instance, ClusterError>;
    async fn patch_instance(&self, name: &str, patch: &Value) -> Result<Instance, ClusterError>;
    /// Patches the status subresource; `patch` is `{"status": {...}}`.
    async fn patch_instance_status(&self, name: &str, patch: &Value) -> Result<(), ClusterError>;
    async fn delete_instance(&self, name: &str) -> Result<(), ClusterError>;

    // Machines and MachineDeployments (untyped)
    async fn get_machine(&self, kind: MachineKind, namespace: &str, name: &str) -> Result<Option<DynamicObject>, ClusterError>;
    async fn list_machines(&self, kind: MachineKind, namespace: &str) -> Result<Vec<DynamicObject>, ClusterError>;
    async fn delete_machine(&self, kind: MachineKind, namespace: &str, name: &str) -> Result<(), ClusterError>;
    /// MachineDeployments labelled `node-group=<node_group>`.
    async fn list_machine_deployments(&self, kind: MachineKind, namespace: &str, node_group: &str) -> Result<Vec<DynamicObject>, ClusterError>;
}
