//! Deletion cascade between Instances, Machines and Nodes.
//!
//! Keyed by Instance, so it still runs after the Machine or Node that backs
//! the Instance has disappeared from the cache.

use super::Reconciler;
use super::instance::is_deleting;
use crate::error::ControllerError;
use cluster_client::MachineKind;
use kube_runtime::controller::Action;
use tracing::{debug, info};

impl Reconciler {
    pub async fn reconcile_instance(&self, name: &str) -> Result<Action, ControllerError> {
        let Some(instance) = self.client.get_instance(name).await? else {
            return Ok(Action::await_change());
        };

        let Some(machine_ref) = instance.spec.machine_ref.clone() else {
            if self.client.get_node(&instance.spec.node_ref.name).await?.is_none() {
                info!(instance = %name, node = %instance.spec.node_ref.name, "Node is gone, deleting its Instance");
                self.client.delete_instance(name).await?;
            }
            return Ok(Action::await_change());
        };

        let kind = MachineKind::from_api_version(&machine_ref.api_version).ok_or_else(|| {
            ControllerError::InvalidObject(format!(
                "Instance {name} references unknown machine API {}",
                machine_ref.api_version
            ))
        })?;

        let Some(machine) = self.client.get_machine(kind, &machine_ref.namespace, &machine_ref.name).await? else {
            info!(instance = %name, machine = %machine_ref.name, "Machine is gone, releasing Instance");
            self.release_instance(&instance).await?;
            return Ok(Action::await_change());
        };

        if is_deleting(&instance) && machine.metadata.deletion_timestamp.is_none() {
            info!(instance = %name, machine = %machine_ref.name, "Instance is being deleted, deleting its Machine");
            self.client.delete_machine(kind, &machine_ref.namespace, &machine_ref.name).await?;
        } else {
            debug!(instance = %name, "Instance and Machine in step");
        }
        Ok(Action::await_change())
    }
}
