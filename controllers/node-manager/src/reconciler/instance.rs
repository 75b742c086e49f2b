//! Instance helpers shared by the Node and Machine reconcilers.
//!
//! These never derive Instance state on their own; callers pass the desired
//! machine reference and the status derived from the machine.

use super::Reconciler;
use crate::error::ControllerError;
use crate::machine::{CREATION_STARTED_DESCRIPTION, DerivedStatus};
use chrono::{SubsecRound, Utc};
use cluster_client::ClusterError;
use crds::well_known::INSTANCE_FINALIZER;
use crds::{BashibleStatus, Instance, InstanceSpec, InstanceStatus, MachineRef, NodeGroup, NodeRef, carry_transition_time};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;
use tracing::{debug, info};

pub(crate) fn has_finalizer(instance: &Instance) -> bool {
    instance
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == INSTANCE_FINALIZER))
}

pub(crate) fn is_deleting(instance: &Instance) -> bool {
    instance.metadata.deletion_timestamp.is_some()
}

impl Reconciler {
    /// Gets the Instance `name`, creating it from `spec` when missing.
    ///
    /// An existing Instance is returned as is; the caller reconciles its spec.
    /// Machine-backed Instances are created with the instance finalizer.
    pub async fn ensure_instance_exists(&self, name: &str, spec: InstanceSpec) -> Result<Instance, ControllerError> {
        if let Some(existing) = self.client.get_instance(name).await? {
            return Ok(existing);
        }

        let finalizers = spec.machine_ref.is_some().then(|| vec![INSTANCE_FINALIZER.to_string()]);
        let instance = Instance {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                finalizers,
                ..Default::default()
            },
            spec,
            status: None,
        };

        match self.client.create_instance(&instance).await {
            Ok(created) => {
                info!(instance = %name, machine_backed = created.is_machine_backed(), "Created Instance");
                Ok(created)
            }
            Err(ClusterError::AlreadyExists(_)) => {
                debug!(instance = %name, "Instance created concurrently, reading it back");
                self.client
                    .get_instance(name)
                    .await?
                    .ok_or_else(|| ClusterError::Conflict(format!("Instance {name} vanished after AlreadyExists")).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Brings `spec.machineRef` in line with `desired`.
    ///
    /// Also restores the instance finalizer on machine-backed Instances that
    /// are not being deleted. The patch is conditional on the resourceVersion
    /// the caller read, so a concurrent writer surfaces as a conflict.
    pub async fn sync_spec(&self, instance: Instance, desired: Option<&MachineRef>) -> Result<(Instance, bool), ControllerError> {
        let ref_changed = instance.spec.machine_ref.as_ref() != desired;
        let needs_finalizer = desired.is_some() && !is_deleting(&instance) && !has_finalizer(&instance);
        if !ref_changed && !needs_finalizer {
            return Ok((instance, false));
        }

        let name = instance.metadata.name.clone().unwrap_or_default();
        let mut metadata = json!({ "resourceVersion": instance.metadata.resource_version });
        if needs_finalizer {
            let mut finalizers = instance.metadata.finalizers.clone().unwrap_or_default();
            finalizers.push(INSTANCE_FINALIZER.to_string());
            metadata["finalizers"] = json!(finalizers);
        }
        let mut patch = json!({ "metadata": metadata });
        if ref_changed {
            patch["spec"] = json!({ "machineRef": desired });
        }

        let updated = self.client.patch_instance(&name, &patch).await?;
        info!(instance = %name, ref_changed, needs_finalizer, "Synced Instance spec");
        Ok((updated, true))
    }

    /// Writes the machine-derived status onto the Instance.
    ///
    /// Conditions reported by the node (bashible, approvals) are kept; only
    /// `MachineReady` is replaced. The class reference follows `node_group`
    /// when it is known. Nothing is written when the result equals the
    /// current status.
    pub async fn sync_status(
        &self,
        instance: &Instance,
        derived: &DerivedStatus,
        node_name: Option<&str>,
        node_group: Option<&NodeGroup>,
    ) -> Result<bool, ControllerError> {
        let current = instance.status.clone().unwrap_or_default();
        let desired = desired_status(&current, derived, node_name, node_group);
        if desired == current {
            return Ok(false);
        }

        let name = instance.metadata.name.clone().unwrap_or_default();
        let patch = json!({
            "metadata": { "resourceVersion": instance.metadata.resource_version },
            "status": desired,
        });
        self.client.patch_instance_status(&name, &patch).await?;
        debug!(instance = %name, machine_status = ?derived.machine_status, "Synced Instance status");
        Ok(true)
    }

    /// Strips the instance finalizer and deletes the Instance unless it is
    /// already being deleted.
    pub(crate) async fn release_instance(&self, instance: &Instance) -> Result<(), ControllerError> {
        let name = instance.metadata.name.clone().unwrap_or_default();
        if has_finalizer(instance) {
            let remaining: Vec<&String> = instance
                .metadata
                .finalizers
                .iter()
                .flatten()
                .filter(|f| *f != INSTANCE_FINALIZER)
                .collect();
            let patch = json!({
                "metadata": {
                    "resourceVersion": instance.metadata.resource_version,
                    "finalizers": remaining,
                }
            });
            match self.client.patch_instance(&name, &patch).await {
                Ok(_) | Err(ClusterError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if !is_deleting(instance) {
            self.client.delete_instance(&name).await?;
        }
        info!(instance = %name, "Released Instance");
        Ok(())
    }
}

/// Computes the Instance status for a machine, starting from `current`.
pub(crate) fn desired_status(
    current: &InstanceStatus,
    derived: &DerivedStatus,
    node_name: Option<&str>,
    node_group: Option<&NodeGroup>,
) -> InstanceStatus {
    let mut status = current.clone();
    if current.phase != Some(derived.phase) {
        status.phase = Some(derived.phase);
        status.last_update_time = Some(derived.phase_time.unwrap_or_else(|| Utc::now().trunc_subsecs(0)));
    }
    status.machine_status = Some(derived.machine_status);
    status.node_ref = node_name.map(|n| NodeRef { name: n.to_string() });

    match &derived.last_operation {
        // A fresh creation notice does not replace a more telling operation.
        Some(op)
            if op.description == CREATION_STARTED_DESCRIPTION
                && !current.last_operation.as_ref().is_some_and(|c| c.description == op.description) => {}
        other => status.last_operation = other.clone(),
    }

    if let Some(ng) = node_group {
        status.class_reference = ng.class_reference().cloned();
    }

    if let Some(condition) = &derived.condition {
        let mut condition = condition.clone();
        // The source condition's time wins; without one, keep ours while the status holds.
        if condition.last_transition_time.is_none() {
            carry_transition_time(&mut condition, &current.conditions, Utc::now().trunc_subsecs(0));
        }
        match status.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => *existing = condition,
            None => status.conditions.push(condition),
        }
    }

    status.bashible_status = BashibleStatus::from_conditions(&status.conditions);
    status
}
