//! NodeGroup CRD
//!
//! Cluster-scoped group of nodes sharing configuration and lifecycle policy.
//! The controller only writes `status`; the spec is owned by users.

use crate::conditions::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "deckhouse.io",
    version = "v1",
    kind = "NodeGroup",
    status = "NodeGroupStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupSpec {
    /// Node type regime
    pub node_type: NodeType,

    /// Autoscaling bounds, only meaningful for `CloudEphemeral`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_instances: Option<CloudInstances>,

    /// Disruptive update policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disruptions: Option<Disruptions>,

    /// Update rollout policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<UpdatePolicy>,
}

/// Node type regime of a group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum NodeType {
    /// Machines are created and removed by the autoscaler
    CloudEphemeral,
    /// Long-lived cloud machines managed outside of the autoscaler
    CloudPermanent,
    /// Hand-provisioned nodes
    #[default]
    Static,
}

impl NodeType {
    /// Value carried by the `node.deckhouse.io/type` node label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CloudEphemeral => "CloudEphemeral",
            Self::CloudPermanent => "CloudPermanent",
            Self::Static => "Static",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CloudInstances {
    /// Minimum machines per zone
    #[serde(default)]
    pub min_per_zone: i32,

    /// Maximum machines per zone
    #[serde(default)]
    pub max_per_zone: i32,

    /// Zones to spread machines over; empty means "use cloud provider discovery"
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub zones: Vec<String>,

    /// Provider machine class the group's machines are built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_reference: Option<ClassReference>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClassReference {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
}

impl NodeGroup {
    /// Machine class of a cloud group, if it names one.
    #[must_use]
    pub fn class_reference(&self) -> Option<&ClassReference> {
        self.spec.cloud_instances.as_ref().and_then(|c| c.class_reference.as_ref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Disruptions {
    /// How disruptive updates get approved
    #[serde(default)]
    pub approval_mode: ApprovalMode,

    /// Settings for `Automatic` mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automatic: Option<AutomaticDisruptions>,

    /// Settings for `RollingUpdate` mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdateDisruptions>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ApprovalMode {
    /// An operator sets the approval annotation by hand
    Manual,
    /// The controller approves, optionally draining first
    #[default]
    Automatic,
    /// The controller approves ready nodes one batch at a time
    RollingUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AutomaticDisruptions {
    /// Cordon and drain the node before approving; defaults to true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain_before_approval: Option<bool>,

    /// Time windows in which approvals may happen
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub windows: Vec<DisruptionWindow>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdateDisruptions {
    /// Time windows in which approvals may happen
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub windows: Vec<DisruptionWindow>,
}

/// `HH:MM`..`HH:MM` UTC window, optionally limited to some weekdays.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DisruptionWindow {
    /// Start, inclusive
    pub from: String,
    /// End, exclusive; may be earlier than `from` to cross midnight
    pub to: String,
    /// Weekday names (`Mon`, `Tuesday`, ...); empty means every day
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub days: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePolicy {
    /// How many nodes may update at once: an integer or a percentage string like `"25%"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<IntOrPercent>,
}

/// Absolute count or percentage.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(untagged)]
pub enum IntOrPercent {
    /// Absolute count
    Int(i64),
    /// `"N%"` or a plain number in string form
    String(String),
}

impl IntOrPercent {
    /// Resolves against `total`, rounding percentages down.
    ///
    /// Returns `None` when the string form cannot be parsed.
    #[must_use]
    pub fn resolve(&self, total: i64) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::String(raw) => {
                let raw = raw.trim();
                match raw.strip_suffix('%') {
                    Some(percent) => percent.trim().parse::<i64>().ok().map(|p| total * p / 100),
                    None => raw.parse::<i64>().ok(),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupStatus {
    /// Nodes labelled for the group
    #[serde(default)]
    pub nodes: i32,

    /// Nodes with `Ready=True`
    #[serde(default)]
    pub ready: i32,

    /// Nodes whose configuration checksum matches the group checksum
    #[serde(default)]
    pub up_to_date: i32,

    /// Desired machine count (CloudEphemeral only)
    #[serde(default)]
    pub desired: i32,

    /// `minPerZone * zones` (CloudEphemeral only)
    #[serde(default)]
    pub min: i32,

    /// `maxPerZone * zones` (CloudEphemeral only)
    #[serde(default)]
    pub max: i32,

    /// Existing machines (CloudEphemeral only)
    #[serde(default)]
    pub instances: i32,

    /// Computed conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Short roll-up of the conditions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_summary: Option<ConditionSummary>,

    /// User-visible error, always in its short rewritten form
    #[serde(default)]
    pub error: String,

    /// Latest failed machines across the group's MachineDeployments.
    ///
    /// Serialized as `null` when absent so a merge patch clears it.
    #[serde(default)]
    pub last_machine_failures: Option<Vec<MachineFailure>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConditionSummary {
    /// `"True"` or `"False"`
    pub ready: String,

    /// Mirrors `status.error`
    #[serde(default)]
    pub status_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MachineFailure {
    /// Machine name
    #[serde(default)]
    pub name: String,

    /// Cloud provider identifier of the machine
    #[serde(default, rename = "providerID")]
    pub provider_id: String,

    /// Owner (MachineSet) of the machine
    #[serde(default)]
    pub owner_ref: String,

    /// Failed operation details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<MachineLastOperation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MachineLastOperation {
    /// Failure description
    #[serde(default)]
    pub description: String,

    /// RFC 3339 timestamp of the failure
    #[serde(default)]
    pub last_update_time: String,

    /// Operation state, e.g. `Failed`
    #[serde(default)]
    pub state: String,

    /// Operation type, e.g. `Create`
    #[serde(default, rename = "type")]
    pub type_: String,
}
