//! Label, annotation and object names shared between the controller and its tooling.

/// Node label naming the owning NodeGroup.
pub const NODE_GROUP_LABEL: &str = "node.deckhouse.io/group";

/// Node label carrying the node type (`Static`, `CloudPermanent`, ...).
pub const NODE_TYPE_LABEL: &str = "node.deckhouse.io/type";

/// Cluster-API style label naming the NodeGroup on Machines and MachineDeployments.
pub const CAPI_NODE_GROUP_LABEL: &str = "node-group";

/// Node annotation with the checksum of the configuration applied to the node.
pub const CONFIGURATION_CHECKSUM_ANNOTATION: &str = "node.deckhouse.io/configuration-checksum";

/// Set by the node when the pending update is disruptive.
pub const DISRUPTION_REQUIRED_ANNOTATION: &str = "update.node.deckhouse.io/disruption-required";

/// Set by the controller to allow the node to apply its update.
pub const APPROVED_ANNOTATION: &str = "update.node.deckhouse.io/approved";

/// Set by the node while it waits for approval.
pub const WAITING_FOR_APPROVAL_ANNOTATION: &str = "update.node.deckhouse.io/waiting-for-approval";

/// Set once a disruptive update has been allowed.
pub const DISRUPTION_APPROVED_ANNOTATION: &str = "update.node.deckhouse.io/disruption-approved";

/// Asks the node-upgrade daemon to drain the node.
pub const DRAINING_ANNOTATION: &str = "update.node.deckhouse.io/draining";

/// Set by the node-upgrade daemon once the node is drained.
pub const DRAINED_ANNOTATION: &str = "update.node.deckhouse.io/drained";

/// Value used by the node-upgrade daemon in the draining/drained annotations.
pub const DRAIN_SOURCE_BASHIBLE: &str = "bashible";

/// Draining annotation value set when an Instance deletion drains its node.
pub const DRAIN_SOURCE_INSTANCE_DELETION: &str = "instance-deletion";

/// Taint placed by the cluster autoscaler on nodes it is about to remove.
pub const AUTOSCALER_DELETION_TAINT: &str = "ToBeDeletedByClusterAutoscaler";

/// Finalizer held on machine-backed Instances until the Machine is gone.
pub const INSTANCE_FINALIZER: &str = "node-manager.hooks.deckhouse.io/instance-controller";

/// Default namespace for Machines, MachineDeployments and the checksum Secret.
pub const DEFAULT_MACHINE_NAMESPACE: &str = "d8-cloud-instance-manager";

/// Secret holding `NodeGroup name -> configuration checksum`.
pub const CONFIGURATION_CHECKSUMS_SECRET: &str = "configuration-checksums";

/// Cloud provider discovery Secret, carries a JSON `zones` list.
pub const CLOUD_PROVIDER_SECRET: &str = "d8-node-manager-cloud-provider";

/// Namespace of the cloud provider discovery Secret.
pub const CLOUD_PROVIDER_SECRET_NAMESPACE: &str = "kube-system";
