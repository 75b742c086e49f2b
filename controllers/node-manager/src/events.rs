//! Kubernetes Event recording.
//!
//! Events are fire-and-forget: a failed publish is logged and never fails
//! the reconcile that emitted it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

/// Reporting component name on emitted Events.
pub const REPORTER: &str = "node-manager-controller";

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, resource_ref: &ObjectReference, type_: EventType, reason: &str, action: &str, note: Option<String>);
}

/// Publisher backed by `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: REPORTER.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, resource_ref: &ObjectReference, type_: EventType, reason: &str, action: &str, note: Option<String>) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Event reasons emitted on NodeGroups.
pub mod reasons {
    pub const MACHINE_CREATING: &str = "MachineCreating";
    pub const MACHINE_FAILED: &str = "MachineFailed";
    pub const NODE_APPROVED: &str = "NodeApproved";
    pub const NODE_UP_TO_DATE: &str = "NodeUpToDate";
    pub const DRAINING_FOR_DISRUPTION: &str = "DrainingForDisruption";
    pub const INVALID_MACHINE: &str = "InvalidMachine";
}

/// Event actions.
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const APPROVE: &str = "Approve";
    pub const DRAIN: &str = "Drain";
}

#[cfg(test)]
pub use recording::{RecordedEvent, RecordingEventPublisher};
