//! Update-approval reconciler
//!
//! Turns the update annotations set on nodes, together with the NodeGroup's
//! disruption policy, into approvals under a concurrency bound. Draining
//! itself is left to the node-upgrade daemon; this reconciler only cordons
//! the node and asks for the drain.

use super::conditions::is_node_ready;
use super::windows::is_in_allowed_window;
use super::{Reconciler, object_ref};
use crate::error::ControllerError;
use crate::events::{actions, reasons};
use crate::metrics;
use chrono::Utc;
use crds::well_known::{
    APPROVED_ANNOTATION, CONFIGURATION_CHECKSUM_ANNOTATION, DISRUPTION_APPROVED_ANNOTATION,
    DISRUPTION_REQUIRED_ANNOTATION, DRAIN_SOURCE_BASHIBLE, DRAINED_ANNOTATION, DRAINING_ANNOTATION,
    WAITING_FOR_APPROVAL_ANNOTATION,
};
use crds::{ApprovalMode, DisruptionWindow, NodeGroup, NodeType};
use k8s_openapi::api::core::v1::Node;
use kube::runtime::events::EventType;
use kube_runtime::controller::Action;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

/// Group whose single node is never cordoned.
const MASTER_NODE_GROUP: &str = "master";

/// Update-related state of one node.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct NodeUpdateState {
    pub name: String,
    pub resource_version: Option<String>,
    pub ready: bool,
    pub checksum: Option<String>,
    pub approved: bool,
    pub waiting_for_approval: bool,
    pub disruption_required: bool,
    pub disruption_approved: bool,
    pub unschedulable: bool,
    /// `draining=bashible`, a drain this controller asked for
    pub draining: bool,
    /// `drained=bashible`
    pub drained: bool,
    /// Any draining or drained annotation, whatever its value
    pub drain_marked: bool,
}

impl NodeUpdateState {
    pub(crate) fn from_node(node: &Node) -> Self {
        let annotations = node.metadata.annotations.clone().unwrap_or_default();
        let by_bashible = |key: &str| annotations.get(key).is_some_and(|v| v == DRAIN_SOURCE_BASHIBLE);
        Self {
            name: node.metadata.name.clone().unwrap_or_default(),
            resource_version: node.metadata.resource_version.clone(),
            ready: is_node_ready(node),
            checksum: annotations.get(CONFIGURATION_CHECKSUM_ANNOTATION).cloned(),
            approved: annotations.contains_key(APPROVED_ANNOTATION),
            waiting_for_approval: annotations.contains_key(WAITING_FOR_APPROVAL_ANNOTATION),
            disruption_required: annotations.contains_key(DISRUPTION_REQUIRED_ANNOTATION),
            disruption_approved: annotations.contains_key(DISRUPTION_APPROVED_ANNOTATION),
            unschedulable: node.spec.as_ref().and_then(|s| s.unschedulable).unwrap_or(false),
            draining: by_bashible(DRAINING_ANNOTATION),
            drained: by_bashible(DRAINED_ANNOTATION),
            drain_marked: annotations.contains_key(DRAINING_ANNOTATION) || annotations.contains_key(DRAINED_ANNOTATION),
        }
    }

    fn up_to_date(&self, checksum: &str) -> bool {
        self.checksum.as_deref() == Some(checksum)
    }
}

/// Value of the `status` label of `node_group_node_status`.
pub(crate) fn calculate_node_status(node: &NodeUpdateState, mode: ApprovalMode, checksum: &str) -> &'static str {
    let disruptive = node.approved && node.disruption_required;
    if node.waiting_for_approval {
        "WaitingForApproval"
    } else if disruptive && node.draining {
        "DrainingForDisruption"
    } else if node.draining {
        "Draining"
    } else if node.drained {
        "Drained"
    } else if disruptive && mode == ApprovalMode::Automatic {
        "WaitingForDisruptionApproval"
    } else if disruptive && mode == ApprovalMode::Manual {
        "WaitingForManualDisruptionApproval"
    } else if node.approved && node.disruption_approved {
        "DisruptionApproved"
    } else if node.approved {
        "Approved"
    } else if node.checksum.as_deref().unwrap_or_default().is_empty() {
        "UpdateFailedNoConfigChecksum"
    } else if !node.up_to_date(checksum) {
        "ToBeUpdated"
    } else {
        "UpToDate"
    }
}

fn approval_mode(ng: &NodeGroup) -> ApprovalMode {
    ng.spec.disruptions.as_ref().map(|d| d.approval_mode).unwrap_or_default()
}

fn disruption_windows(ng: &NodeGroup, mode: ApprovalMode) -> &[DisruptionWindow] {
    let disruptions = ng.spec.disruptions.as_ref();
    let windows = match mode {
        ApprovalMode::Automatic => disruptions.and_then(|d| d.automatic.as_ref()).map(|a| a.windows.as_slice()),
        ApprovalMode::RollingUpdate => disruptions.and_then(|d| d.rolling_update.as_ref()).map(|r| r.windows.as_slice()),
        ApprovalMode::Manual => None,
    };
    windows.unwrap_or_default()
}

/// How many nodes of the group may be approved at once, at least 1.
pub(crate) fn max_concurrent(ng: &NodeGroup, node_count: usize) -> i64 {
    let total = if ng.spec.node_type == NodeType::CloudEphemeral {
        ng.status.as_ref().map_or(0, |s| i64::from(s.desired))
    } else {
        i64::try_from(node_count).unwrap_or(i64::MAX)
    };
    ng.spec
        .update
        .as_ref()
        .and_then(|u| u.max_concurrent.as_ref())
        .and_then(|m| m.resolve(total))
        .unwrap_or(1)
        .max(1)
}

fn is_candidate(node: &NodeUpdateState, mode: ApprovalMode, checksum: &str) -> bool {
    if node.approved || node.up_to_date(checksum) {
        return false;
    }
    match mode {
        ApprovalMode::Manual => node.disruption_required,
        ApprovalMode::Automatic => true,
        ApprovalMode::RollingUpdate => node.ready,
    }
}

fn annotations_patch(node: &NodeUpdateState, annotations: Map<String, Value>) -> Value {
    json!({
        "metadata": {
            "resourceVersion": node.resource_version,
            "annotations": annotations,
        }
    })
}

impl Reconciler {
    pub async fn reconcile_update_approval(&self, name: &str) -> Result<Action, ControllerError> {
        let Some(ng) = self.client.get_node_group(name).await? else {
            return Ok(Action::await_change());
        };
        let checksum = match self.configuration_checksums().await? {
            Some(mut sums) => sums.remove(name).unwrap_or_default(),
            None => String::new(),
        };
        if checksum.is_empty() {
            debug!(node_group = %name, "No configuration checksum, skipping update approval");
            return Ok(Action::await_change());
        }

        // Snapshot the group's nodes in a stable order
        let mode = approval_mode(&ng);
        let mut nodes: Vec<NodeUpdateState> = self
            .client
            .list_nodes_in_group(name)
            .await?
            .iter()
            .map(NodeUpdateState::from_node)
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));

        for node in &nodes {
            metrics::set_node_status(name, &node.name, calculate_node_status(node, mode, &checksum));
        }

        // Finish nodes that already applied the checksum
        for node in nodes.iter_mut() {
            if (node.approved || node.disruption_required) && node.up_to_date(&checksum) && node.ready {
                self.complete_update(&ng, node).await?;
            }
        }

        // Respect maxConcurrent, counting approvals still in flight
        let in_progress = i64::try_from(nodes.iter().filter(|n| n.approved).count()).unwrap_or(i64::MAX);
        let mut budget = max_concurrent(&ng, nodes.len()) - in_progress;
        if budget <= 0 {
            debug!(node_group = %name, in_progress, "Concurrency limit reached");
            return Ok(Action::await_change());
        }

        // Already cordoned and draining nodes go first
        let (cordoned, rest): (Vec<&NodeUpdateState>, Vec<&NodeUpdateState>) = nodes
            .iter()
            .filter(|n| is_candidate(n, mode, &checksum))
            .partition(|n| n.unschedulable && n.draining);
        if cordoned.is_empty() && rest.is_empty() {
            return Ok(Action::await_change());
        }

        if !is_in_allowed_window(disruption_windows(&ng, mode), Utc::now()) {
            debug!(node_group = %name, "Outside of disruption windows");
            return Ok(Action::await_change());
        }

        // Drain if required, otherwise approve
        for node in cordoned.into_iter().chain(rest) {
            if budget <= 0 {
                break;
            }
            budget -= 1;

            if mode == ApprovalMode::Automatic && self.needs_drain(&ng, node) {
                if !node.unschedulable {
                    self.start_drain(&ng, node).await?;
                    continue;
                }
                if node.draining && !node.drained {
                    debug!(node_group = %name, node = %node.name, "Waiting for drain");
                    continue;
                }
            }
            self.approve(&ng, node, mode).await?;
        }
        Ok(Action::await_change())
    }

    fn needs_drain(&self, ng: &NodeGroup, node: &NodeUpdateState) -> bool {
        let status = ng.status.clone().unwrap_or_default();
        if ng.metadata.name.as_deref() == Some(MASTER_NODE_GROUP) && status.nodes == 1 {
            return false;
        }
        if self.settings.controller_node_name.as_deref() == Some(node.name.as_str()) && status.ready < 2 {
            return false;
        }
        ng.spec
            .disruptions
            .as_ref()
            .and_then(|d| d.automatic.as_ref())
            .and_then(|a| a.drain_before_approval)
            .unwrap_or(true)
    }

    /// Clears the update annotations of a node that applied the group checksum.
    async fn complete_update(&self, ng: &NodeGroup, node: &mut NodeUpdateState) -> Result<(), ControllerError> {
        let mut annotations = Map::new();
        for key in [
            APPROVED_ANNOTATION,
            DISRUPTION_REQUIRED_ANNOTATION,
            WAITING_FOR_APPROVAL_ANNOTATION,
            DISRUPTION_APPROVED_ANNOTATION,
            DRAINING_ANNOTATION,
            DRAINED_ANNOTATION,
        ] {
            annotations.insert(key.to_string(), Value::Null);
        }
        let mut patch = annotations_patch(node, annotations);
        if node.drain_marked {
            patch["spec"] = json!({ "unschedulable": null });
        }
        self.client.patch_node(&node.name, &patch).await?;

        let ng_name = ng.metadata.name.clone().unwrap_or_default();
        info!(node_group = %ng_name, node = %node.name, "Node is up to date");
        self.events
            .publish(
                &object_ref(ng),
                EventType::Normal,
                reasons::NODE_UP_TO_DATE,
                actions::RECONCILE,
                Some(format!("Node {} is now up to date", node.name)),
            )
            .await;

        let unschedulable = node.unschedulable && !node.drain_marked;
        *node = NodeUpdateState {
            name: std::mem::take(&mut node.name),
            ready: node.ready,
            checksum: node.checksum.take(),
            unschedulable,
            ..Default::default()
        };
        Ok(())
    }

    async fn start_drain(&self, ng: &NodeGroup, node: &NodeUpdateState) -> Result<(), ControllerError> {
        let patch = json!({
            "metadata": {
                "resourceVersion": node.resource_version,
                "annotations": { DRAINING_ANNOTATION: DRAIN_SOURCE_BASHIBLE },
            },
            "spec": { "unschedulable": true },
        });
        self.client.patch_node(&node.name, &patch).await?;

        let ng_name = ng.metadata.name.clone().unwrap_or_default();
        info!(node_group = %ng_name, node = %node.name, "Draining node before approval");
        self.events
            .publish(
                &object_ref(ng),
                EventType::Normal,
                reasons::DRAINING_FOR_DISRUPTION,
                actions::DRAIN,
                Some(format!("Draining node {} for disruption", node.name)),
            )
            .await;
        Ok(())
    }

    async fn approve(&self, ng: &NodeGroup, node: &NodeUpdateState, mode: ApprovalMode) -> Result<(), ControllerError> {
        let mut annotations = Map::new();
        annotations.insert(APPROVED_ANNOTATION.to_string(), json!(""));
        annotations.insert(WAITING_FOR_APPROVAL_ANNOTATION.to_string(), Value::Null);
        if node.disruption_required && mode != ApprovalMode::Manual {
            annotations.insert(DISRUPTION_APPROVED_ANNOTATION.to_string(), json!(""));
        }
        self.client.patch_node(&node.name, &annotations_patch(node, annotations)).await?;

        let ng_name = ng.metadata.name.clone().unwrap_or_default();
        info!(node_group = %ng_name, node = %node.name, mode = ?mode, "Approved node update");
        self.events
            .publish(
                &object_ref(ng),
                EventType::Normal,
                reasons::NODE_APPROVED,
                actions::APPROVE,
                Some(format!("Update approved for node {}", node.name)),
            )
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{IntOrPercent, NodeGroupSpec, NodeGroupStatus, UpdatePolicy};

    fn group(node_type: NodeType, max: Option<IntOrPercent>, desired: i32) -> NodeGroup {
        let mut ng = NodeGroup::new(
            "worker",
            NodeGroupSpec {
                node_type,
                update: Some(UpdatePolicy { max_concurrent: max }),
                ..Default::default()
            },
        );
        ng.status = Some(NodeGroupStatus { desired, ..Default::default() });
        ng
    }

    #[test]
    fn test_max_concurrent_defaults_and_floors() {
        assert_eq!(max_concurrent(&group(NodeType::Static, None, 0), 10), 1);
        assert_eq!(max_concurrent(&group(NodeType::Static, Some(IntOrPercent::Int(3)), 0), 10), 3);
        assert_eq!(
            max_concurrent(&group(NodeType::Static, Some(IntOrPercent::String("25%".into())), 0), 10),
            2
        );
        assert_eq!(
            max_concurrent(&group(NodeType::Static, Some(IntOrPercent::String("10%".into())), 0), 3),
            1
        );
    }

    #[test]
    fn test_max_concurrent_uses_desired_for_cloud_ephemeral() {
        let ng = group(NodeType::CloudEphemeral, Some(IntOrPercent::String("50%".into())), 8);
        assert_eq!(max_concurrent(&ng, 2), 4);
    }

    #[test]
    fn test_node_status_precedence() {
        let mut node = NodeUpdateState {
            name: "n1".into(),
            checksum: Some("old".into()),
            ..Default::default()
        };
        assert_eq!(calculate_node_status(&node, ApprovalMode::Automatic, "new"), "ToBeUpdated");

        node.approved = true;
        node.disruption_required = true;
        assert_eq!(calculate_node_status(&node, ApprovalMode::Automatic, "new"), "WaitingForDisruptionApproval");
        assert_eq!(calculate_node_status(&node, ApprovalMode::Manual, "new"), "WaitingForManualDisruptionApproval");

        node.draining = true;
        assert_eq!(calculate_node_status(&node, ApprovalMode::Automatic, "new"), "DrainingForDisruption");

        let fresh = NodeUpdateState {
            checksum: Some("new".into()),
            ..Default::default()
        };
        assert_eq!(calculate_node_status(&fresh, ApprovalMode::Automatic, "new"), "UpToDate");
        assert_eq!(
            calculate_node_status(&NodeUpdateState::default(), ApprovalMode::Automatic, "new"),
            "UpdateFailedNoConfigChecksum"
        );
    }

    #[test]
    fn test_candidates_by_mode() {
        let plain = NodeUpdateState {
            checksum: Some("old".into()),
            ..Default::default()
        };
        let disruptive = NodeUpdateState {
            disruption_required: true,
            ..plain.clone()
        };
        assert!(!is_candidate(&plain, ApprovalMode::Manual, "new"));
        assert!(is_candidate(&disruptive, ApprovalMode::Manual, "new"));
        assert!(is_candidate(&plain, ApprovalMode::Automatic, "new"));
        assert!(!is_candidate(&plain, ApprovalMode::RollingUpdate, "new"));
        assert!(is_candidate(&NodeUpdateState { ready: true, ..plain.clone() }, ApprovalMode::RollingUpdate, "new"));
        assert!(!is_candidate(&NodeUpdateState { approved: true, ..disruptive }, ApprovalMode::Manual, "new"));
    }
}
