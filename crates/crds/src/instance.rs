//! Instance CRD
//!
//! One Instance exists per cluster member: either backed by a Machine
//! (`spec.machineRef` set, same name as the Machine) or by a static Node
//! (same name as the Node).

use crate::conditions::{Condition, find_condition};
use crate::node_group::ClassReference;
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition set by the node bootstrap agent once the node configuration is applied.
pub const BASHIBLE_READY_CONDITION: &str = "BashibleReady";
/// Condition set while the node waits for an update approval.
pub const WAITING_APPROVAL_CONDITION: &str = "WaitingApproval";
/// Condition set while the node waits for a disruption approval.
pub const WAITING_DISRUPTION_APPROVAL_CONDITION: &str = "WaitingDisruptionApproval";
/// Condition derived from the backing Machine.
pub const MACHINE_READY_CONDITION: &str = "MachineReady";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[kube(
    group = "deckhouse.io",
    version = "v1alpha1",
    kind = "Instance",
    status = "InstanceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    /// Node this instance stands for
    pub node_ref: NodeRef,

    /// Backing Machine, absent for static nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_ref: Option<MachineRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeRef {
    /// Node name
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MachineRef {
    /// Machine kind, always `Machine` today
    pub kind: String,
    /// `group/version` of the machine API
    pub api_version: String,
    /// Machine name
    pub name: String,
    /// Machine namespace
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    /// Lifecycle phase of the backing machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<InstancePhase>,

    /// Coarse machine health
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_status: Option<MachineStatus>,

    /// Node the machine is bound to. Serialized as `null` when unbound so a
    /// merge patch clears it.
    #[serde(default)]
    pub node_ref: Option<NodeRef>,

    /// When `phase` last changed
    #[serde(default)]
    pub last_update_time: Option<DateTime<Utc>>,

    /// Last operation reported by or derived from the machine
    #[serde(default)]
    pub last_operation: Option<LastOperation>,

    /// Machine class of the owning NodeGroup
    #[serde(default)]
    pub class_reference: Option<ClassReference>,

    /// Machine and bootstrap conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Derived from the bootstrap conditions
    #[serde(default)]
    pub bashible_status: BashibleStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum InstancePhase {
    /// Waiting to be provisioned
    Pending,
    /// Infrastructure is being created
    Provisioning,
    /// Infrastructure exists, node not yet joined
    Provisioned,
    /// Node joined and running
    Running,
    /// Legacy machine API: created, not yet joined
    Available,
    /// Legacy machine API: creation failed
    Failed,
    /// Legacy machine API: repeatedly failing
    CrashLoopBackOff,
    /// Machine is being deleted
    Deleting,
    /// Machine deleted
    Deleted,
    /// Deletion requested on the Instance or Machine
    Terminating,
    /// Node is being drained ahead of deletion
    Draining,
    /// Phase could not be determined
    #[default]
    Unknown,
}

impl InstancePhase {
    /// Maps a machine phase string onto a phase, falling back to `Unknown`.
    #[must_use]
    pub fn from_machine_phase(phase: &str) -> Self {
        match phase {
            "Pending" => Self::Pending,
            "Provisioning" => Self::Provisioning,
            "Provisioned" => Self::Provisioned,
            "Running" => Self::Running,
            "Available" => Self::Available,
            "Failed" => Self::Failed,
            "CrashLoopBackOff" => Self::CrashLoopBackOff,
            "Deleting" => Self::Deleting,
            "Deleted" => Self::Deleted,
            "Terminating" => Self::Terminating,
            "Draining" => Self::Draining,
            _ => Self::Unknown,
        }
    }

    /// Phases reached once deletion started.
    #[must_use]
    pub fn is_deletion(self) -> bool {
        matches!(self, Self::Deleting | Self::Deleted | Self::Terminating)
    }

    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::CrashLoopBackOff)
    }
}

/// Most recent machine operation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    #[serde(default)]
    pub description: String,

    /// `description` cut down for table output
    #[serde(default)]
    pub short_description: String,

    /// `Create`, `Delete`, `HealthCheck`, ...
    #[serde(default, rename = "type")]
    pub type_: String,

    /// `Processing`, `Failed`, `Successful`, ...
    #[serde(default)]
    pub state: String,

    #[serde(default)]
    pub last_update_time: Option<DateTime<Utc>>,
}


/// Coarse machine health surfaced to upper-layer tooling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum MachineStatus {
    /// Not ready yet, nothing wrong observed
    #[default]
    Progressing,
    /// Machine reports ready
    Ready,
    /// Deletion is stuck, usually on drain
    Blocked,
    /// Machine is rebooting
    Rebooting,
    /// Machine reports a failure
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum BashibleStatus {
    /// Configuration applied
    Ready,
    /// Waiting for an update or disruption approval
    WaitingApproval,
    /// Configuration failed to apply
    Error,
    /// No information yet
    #[default]
    Unknown,
}

impl BashibleStatus {
    /// Derives the bootstrap status from Instance conditions.
    ///
    /// Any pending approval wins; otherwise `BashibleReady` decides.
    #[must_use]
    pub fn from_conditions(conditions: &[Condition]) -> Self {
        let waiting = [WAITING_APPROVAL_CONDITION, WAITING_DISRUPTION_APPROVAL_CONDITION]
            .iter()
            .any(|t| find_condition(conditions, t).is_some_and(Condition::is_true));
        if waiting {
            return Self::WaitingApproval;
        }

        match find_condition(conditions, BASHIBLE_READY_CONDITION).map(|c| c.status) {
            Some(crate::ConditionStatus::True) => Self::Ready,
            Some(crate::ConditionStatus::False) => Self::Error,
            _ => Self::Unknown,
        }
    }
}

impl Instance {
    /// True when the instance is backed by a Machine.
    #[must_use]
    pub fn is_machine_backed(&self) -> bool {
        self.spec.machine_ref.is_some()
    }
}
