//! Machine-source reconciler
//!
//! Keeps one Instance per Machine of either API, mirrors the machine status
//! onto it and pushes Instance deletion back to the Machine.

use super::Reconciler;
use super::instance::is_deleting;
use crate::error::ControllerError;
use crate::events::{actions, reasons};
use crate::machine::Machine;
use cluster_client::{ClusterError, MachineKind};
use crds::well_known::{DRAIN_SOURCE_INSTANCE_DELETION, DRAINING_ANNOTATION};
use crds::{Instance, InstancePhase, InstanceSpec, NodeRef};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::DynamicObject;
use kube::runtime::events::EventType;
use kube_runtime::controller::Action;
use serde_json::json;
use tracing::{debug, info, warn};

fn machine_object_ref(obj: &DynamicObject) -> ObjectReference {
    ObjectReference {
        api_version: obj.types.as_ref().map(|t| t.api_version.clone()),
        kind: obj.types.as_ref().map(|t| t.kind.clone()),
        name: obj.metadata.name.clone(),
        namespace: obj.metadata.namespace.clone(),
        uid: obj.metadata.uid.clone(),
        resource_version: obj.metadata.resource_version.clone(),
        ..Default::default()
    }
}

impl Reconciler {
    pub async fn reconcile_machine(&self, kind: MachineKind, namespace: &str, name: &str) -> Result<Action, ControllerError> {
        let Some(obj) = self.client.get_machine(kind, namespace, name).await? else {
            if let Some(instance) = self.client.get_instance(name).await?.filter(|i| i.is_machine_backed()) {
                info!(machine = %name, "Machine is gone, releasing its Instance");
                self.release_instance(&instance).await?;
            }
            return Ok(Action::await_change());
        };

        let machine = match Machine::from_object(&obj) {
            Ok(machine) => machine,
            Err(e @ ControllerError::UnsupportedMachineKind(_)) => {
                self.events
                    .publish(
                        &machine_object_ref(&obj),
                        EventType::Warning,
                        reasons::INVALID_MACHINE,
                        actions::RECONCILE,
                        Some(e.to_string()),
                    )
                    .await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let machine_ref = machine.machine_ref();
        let spec = InstanceSpec {
            node_ref: NodeRef { name: machine.name.clone() },
            machine_ref: Some(machine_ref.clone()),
        };
        let instance = self.ensure_instance_exists(&machine.name, spec).await?;
        let (instance, _) = self.sync_spec(instance, Some(&machine_ref)).await?;

        if is_deleting(&instance) && !machine.deleting {
            info!(machine = %machine.name, kind = kind.as_str(), "Instance is being deleted, deleting its Machine");
            self.client.delete_machine(kind, &machine.namespace, &machine.name).await?;
        }

        let node_group = match &machine.node_group {
            Some(group) => self.client.get_node_group(group).await?,
            None => None,
        };

        let derived = machine.status(is_deleting(&instance));
        let current_phase = instance.status.as_ref().and_then(|s| s.phase);
        if derived.phase == InstancePhase::Draining && current_phase != Some(InstancePhase::Draining) {
            self.mark_node_draining(&instance, &machine).await?;
        }

        let changed = self
            .sync_status(&instance, &derived, machine.node_name.as_deref(), node_group.as_ref())
            .await?;
        debug!(machine = %machine.name, changed, machine_status = ?derived.machine_status, "Reconciled Machine");
        Ok(Action::await_change())
    }

    /// Annotates the machine's node as draining for deletion.
    async fn mark_node_draining(&self, instance: &Instance, machine: &Machine) -> Result<(), ControllerError> {
        let node_name = machine
            .node_name
            .clone()
            .or_else(|| instance.status.as_ref()?.node_ref.as_ref().map(|r| r.name.clone()))
            .filter(|n| !n.is_empty());
        let Some(node) = node_name else {
            warn!(machine = %machine.name, "Machine is draining but has no node to annotate");
            return Ok(());
        };

        info!(machine = %machine.name, node = %node, "Marking node as draining for Instance deletion");
        let patch = json!({
            "metadata": { "annotations": { DRAINING_ANNOTATION: DRAIN_SOURCE_INSTANCE_DELETION } },
        });
        match self.client.patch_node(&node, &patch).await {
            Ok(()) | Err(ClusterError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
