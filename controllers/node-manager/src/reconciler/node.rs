//! Node reconciler
//!
//! Keeps an Instance for every Static and CloudPermanent node and removes it
//! once the node is gone. Machine-backed Instances are left to the machine
//! reconciler.

use super::Reconciler;
use crate::error::ControllerError;
use cluster_client::ClusterError;
use crds::well_known::NODE_TYPE_LABEL;
use crds::{InstanceSpec, NodeRef, NodeType};
use k8s_openapi::api::core::v1::Node;
use kube_runtime::controller::Action;
use tracing::{debug, info};

/// Node types whose Instances this reconciler owns.
const STATIC_TYPES: [NodeType; 2] = [NodeType::Static, NodeType::CloudPermanent];

pub(crate) fn is_static_node(node: &Node) -> bool {
    node.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(NODE_TYPE_LABEL))
        .is_some_and(|t| STATIC_TYPES.iter().any(|s| s.as_str() == t))
}

impl Reconciler {
    pub async fn reconcile_node(&self, name: &str) -> Result<Action, ControllerError> {
        let Some(node) = self.client.get_node(name).await? else {
            let instance = self.client.get_instance(name).await?;
            if instance.is_some_and(|i| !i.is_machine_backed()) {
                info!(node = %name, "Node is gone, deleting its Instance");
                match self.client.delete_instance(name).await {
                    Ok(()) | Err(ClusterError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            return Ok(Action::await_change());
        };

        if !is_static_node(&node) {
            debug!(node = %name, "Not a static node, nothing to do");
            return Ok(Action::await_change());
        }

        // Recreates an Instance deleted behind our back; a no-op read otherwise.
        let spec = InstanceSpec {
            node_ref: NodeRef { name: name.to_string() },
            machine_ref: None,
        };
        self.ensure_instance_exists(name, spec).await?;
        Ok(Action::await_change())
    }
}
