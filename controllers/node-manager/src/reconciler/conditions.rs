//! NodeGroup condition calculation.
//!
//! Pure functions: everything the calculation needs is passed in, so the
//! rules can be tested without a cluster.

use chrono::{DateTime, Utc};
use crds::well_known::{
    APPROVED_ANNOTATION, AUTOSCALER_DELETION_TAINT, CONFIGURATION_CHECKSUM_ANNOTATION, DISRUPTION_REQUIRED_ANNOTATION,
};
use crds::{Condition, ConditionStatus, ConditionSummary, NodeType, carry_transition_time};
use k8s_openapi::api::core::v1::Node;

pub const READY: &str = "Ready";
pub const UPDATING: &str = "Updating";
pub const WAITING_FOR_DISRUPTIVE_APPROVAL: &str = "WaitingForDisruptiveApproval";
pub const ERROR: &str = "Error";
pub const SCALING: &str = "Scaling";
pub const FROZEN: &str = "Frozen";

/// The parts of a Node the conditions depend on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeView {
    pub name: String,
    pub ready: bool,
    pub checksum: Option<String>,
    pub disruption_required: bool,
    pub approved: bool,
    pub autoscaler_deleting: bool,
}

impl NodeView {
    pub fn from_node(node: &Node) -> Self {
        let annotations = node.metadata.annotations.as_ref();
        let has = |key: &str| annotations.is_some_and(|a| a.contains_key(key));
        Self {
            name: node.metadata.name.clone().unwrap_or_default(),
            ready: is_node_ready(node),
            checksum: annotations.and_then(|a| a.get(CONFIGURATION_CHECKSUM_ANNOTATION)).cloned(),
            disruption_required: has(DISRUPTION_REQUIRED_ANNOTATION),
            approved: has(APPROVED_ANNOTATION),
            autoscaler_deleting: node
                .spec
                .as_ref()
                .and_then(|s| s.taints.as_ref())
                .is_some_and(|t| t.iter().any(|t| t.key == AUTOSCALER_DELETION_TAINT)),
        }
    }

    fn out_of_date(&self, group_checksum: &str) -> bool {
        !group_checksum.is_empty() && self.checksum.as_deref() != Some(group_checksum)
    }

    fn waiting_for_disruptive_approval(&self, group_checksum: &str) -> bool {
        self.disruption_required && !self.approved && self.out_of_date(group_checksum)
    }
}

pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|c| c.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

/// Group-level inputs of the calculation.
#[derive(Debug, Clone, Default)]
pub struct GroupView {
    pub node_type: NodeType,
    pub checksum: String,
    pub desired: i32,
    pub instances: i32,
    pub frozen: bool,
    pub generation: Option<i64>,
}

/// Computes the NodeGroup conditions.
///
/// `lastTransitionTime` is taken from `previous` whenever the status of a
/// condition did not change.
pub fn calculate_conditions(
    group: &GroupView,
    nodes: &[NodeView],
    previous: &[Condition],
    errors: &[String],
    now: DateTime<Utc>,
) -> Vec<Condition> {
    let cloud_ephemeral = group.node_type == NodeType::CloudEphemeral;
    let mut conditions = Vec::with_capacity(6);

    let total = count(nodes.len());
    let ready = count(nodes.iter().filter(|n| n.ready).count());
    conditions.push(if cloud_ephemeral {
        if group.desired > 0 && ready >= group.desired {
            Condition::new(READY, ConditionStatus::True, "AllNodesReady", format!("All {ready} nodes are ready"))
        } else if group.desired == 0 {
            Condition::new(READY, ConditionStatus::False, "NoNodes", "No nodes desired")
        } else {
            Condition::new(
                READY,
                ConditionStatus::False,
                "NotAllNodesReady",
                format!("{ready} of {} nodes are ready", group.desired),
            )
        }
    } else if total > 0 && ready == total {
        Condition::new(READY, ConditionStatus::True, "AllNodesReady", format!("All {ready} nodes are ready"))
    } else if total == 0 {
        Condition::new(READY, ConditionStatus::False, "NoNodes", "No nodes in the group")
    } else {
        Condition::new(READY, ConditionStatus::False, "NotAllNodesReady", format!("{ready} of {total} nodes are ready"))
    });

    let mut sorted: Vec<&NodeView> = nodes.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    let (waiting, updating): (Vec<&NodeView>, Vec<&NodeView>) = sorted
        .into_iter()
        .filter(|n| n.out_of_date(&group.checksum))
        .partition(|n| n.waiting_for_disruptive_approval(&group.checksum));

    conditions.push(if updating.is_empty() {
        Condition::new(UPDATING, ConditionStatus::False, "NoUpdatesInProgress", "")
    } else {
        Condition::new(UPDATING, ConditionStatus::True, "NodesUpdating", format!("Nodes updating: {}", names(&updating)))
    });

    conditions.push(if waiting.is_empty() {
        Condition::new(WAITING_FOR_DISRUPTIVE_APPROVAL, ConditionStatus::False, "NoDisruptiveUpdates", "")
    } else {
        Condition::new(
            WAITING_FOR_DISRUPTIVE_APPROVAL,
            ConditionStatus::True,
            "WaitingForApproval",
            format!("Nodes waiting for approval: {}", names(&waiting)),
        )
    });

    conditions.push(if errors.is_empty() {
        Condition::new(ERROR, ConditionStatus::False, "NoErrors", "")
    } else {
        Condition::new(ERROR, ConditionStatus::True, "ErrorOccurred", errors.join("|").trim().to_string())
    });

    if cloud_ephemeral {
        let autoscaler_deleting = nodes.iter().any(|n| n.autoscaler_deleting);
        conditions.push(if group.instances < group.desired {
            Condition::new(
                SCALING,
                ConditionStatus::True,
                "ScalingUp",
                format!("Scaling up: {} instances, {} desired", group.instances, group.desired),
            )
        } else if group.instances > group.desired {
            Condition::new(
                SCALING,
                ConditionStatus::True,
                "ScalingDown",
                format!("Scaling down: {} instances, {} desired", group.instances, group.desired),
            )
        } else if autoscaler_deleting {
            Condition::new(SCALING, ConditionStatus::True, "ScalingDown", "Cluster autoscaler is removing nodes")
        } else {
            Condition::new(SCALING, ConditionStatus::False, "NotScaling", "Desired number of instances reached")
        });

        conditions.push(if group.frozen {
            Condition::new(FROZEN, ConditionStatus::True, "MachineDeploymentFrozen", "MachineDeployment is frozen due to errors")
        } else {
            Condition::new(FROZEN, ConditionStatus::False, "NotFrozen", "")
        });
    }

    for condition in &mut conditions {
        condition.observed_generation = group.generation;
        carry_transition_time(condition, previous, now);
    }
    conditions
}

/// Roll-up shown next to the NodeGroup: ready exactly when there is no error.
pub fn condition_summary(error: &str) -> ConditionSummary {
    ConditionSummary {
        ready: if error.is_empty() { "True" } else { "False" }.to_string(),
        status_message: error.to_string(),
    }
}

fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn names(nodes: &[&NodeView]) -> String {
    nodes.iter().map(|n| n.name.as_str()).collect::<Vec<_>>().join(", ")
}
