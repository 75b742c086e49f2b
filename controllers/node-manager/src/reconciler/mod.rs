//! Reconciliation logic for NodeGroups, Instances, Nodes and Machines.
//!
//! One [`Reconciler`] is shared by every dispatcher; each submodule adds the
//! `reconcile_*` entry point for one reconciler:
//! - `nodegroup_status`: counters, conditions and failures on `NodeGroup.status`
//! - `update_approval`: approval annotations on the nodes of a group
//! - `node`: Instances for static nodes
//! - `machine`: Instances for Machines, status mirroring
//! - `cascade`: deletion propagation between Instances, Machines and Nodes
//!
//! `instance` holds the Instance helpers the Node and Machine reconcilers share.

pub mod cascade;
pub mod conditions;
pub mod instance;
pub mod machine;
pub mod node;
pub mod nodegroup_status;
pub mod update_approval;
pub mod windows;

#[cfg(test)]
mod nodegroup_status_test;
#[cfg(test)]
mod update_approval_test;

use crate::backoff::FibonacciBackoff;
use crate::error::ControllerError;
use crate::events::EventPublisher;
use cluster_client::ClusterClient;
use crds::well_known::CONFIGURATION_CHECKSUMS_SECRET;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Resource;
use kube_runtime::controller::Action;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Requeue delay after an optimistic-concurrency conflict.
const CONFLICT_REQUEUE: Duration = Duration::from_secs(2);

/// Backoff state for a resource
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

impl BackoffState {
    fn new() -> Self {
        Self {
            backoff: FibonacciBackoff::new(5, 300),
            error_count: 0,
        }
    }
}

/// Process-level settings the reconcilers need.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Namespace of Machines, MachineDeployments and the checksum Secret
    pub machine_namespace: String,
    /// Node hosting the platform controller, never drained while its group is small
    pub controller_node_name: Option<String>,
}

/// Reconciles node manager resources.
pub struct Reconciler {
    pub(crate) client: Arc<dyn ClusterClient>,
    pub(crate) events: Arc<dyn EventPublisher>,
    pub(crate) settings: Settings,
    /// Error count tracking per reconciler key (controller/name -> BackoffState)
    backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
    /// Last event message emitted per NodeGroup
    last_event_messages: Mutex<HashMap<String, String>>,
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(client: Arc<dyn ClusterClient>, events: Arc<dyn EventPublisher>, settings: Settings) -> Self {
        Self {
            client,
            events,
            settings,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
            last_event_messages: Mutex::new(HashMap::new()),
        }
    }

    /// Maps a failed reconcile onto a requeue decision.
    ///
    /// Conflicts retry quickly and quietly, malformed objects wait for the
    /// next change, everything else backs off per key.
    pub fn error_action(&self, key: &str, error: &ControllerError) -> Action {
        if error.is_conflict() {
            debug!(key, error = %error, "Conflict, requeueing");
            return Action::requeue(CONFLICT_REQUEUE);
        }
        if error.is_invalid_object() {
            error!(key, error = %error, "Malformed object, waiting for the next change");
            return Action::await_change();
        }

        let (delay, error_count) = match self.backoff_states.lock() {
            Ok(mut states) => {
                let state = states.entry(key.to_string()).or_insert_with(BackoffState::new);
                state.error_count += 1;
                (state.backoff.next_backoff(), state.error_count)
            }
            Err(e) => {
                warn!("Failed to lock backoff_states: {}, using default backoff", e);
                (Duration::from_secs(60), 0)
            }
        };
        warn!(key, error = %error, error_count, retry_secs = delay.as_secs(), "Reconcile failed, backing off");
        Action::requeue(delay)
    }

    /// Drops the backoff state for a key (on successful reconciliation)
    pub fn reset_error(&self, key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(key);
        }
    }

    /// Consecutive failures recorded for a key.
    pub fn error_count(&self, key: &str) -> u32 {
        self.backoff_states
            .lock()
            .ok()
            .and_then(|states| states.get(key).map(|s| s.error_count))
            .unwrap_or(0)
    }

    /// Records `message` as the latest event for `node_group`.
    ///
    /// Returns false when the same message was already recorded.
    pub(crate) fn remember_event(&self, node_group: &str, message: &str) -> bool {
        let mut last = self
            .last_event_messages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if last.get(node_group).is_some_and(|prev| prev == message) {
            return false;
        }
        last.insert(node_group.to_string(), message.to_string());
        true
    }

    /// Drops the dedup entry of a deleted NodeGroup.
    pub(crate) fn forget_event(&self, node_group: &str) {
        self.last_event_messages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(node_group);
    }

    /// Configuration checksums per NodeGroup, `None` when the Secret is missing.
    pub(crate) async fn configuration_checksums(&self) -> Result<Option<BTreeMap<String, String>>, ControllerError> {
        let secret = self
            .client
            .get_secret(&self.settings.machine_namespace, CONFIGURATION_CHECKSUMS_SECRET)
            .await?;
        Ok(secret.map(|s| {
            s.data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned()))
                .collect()
        }))
    }

    /// Expected checksum for one group, empty when unknown.
    pub(crate) async fn group_checksum(&self, node_group: &str) -> Result<String, ControllerError> {
        Ok(self
            .configuration_checksums()
            .await?
            .and_then(|mut sums| sums.remove(node_group))
            .unwrap_or_default())
    }
}

/// Reference used when publishing events about a typed object.
pub(crate) fn object_ref<K: Resource<DynamicType = ()>>(obj: &K) -> ObjectReference {
    obj.object_ref(&())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_reconciler;
    use cluster_client::{ClusterError, MockClusterClient};

    #[test]
    fn test_conflict_requeues_quickly_without_backoff() {
        let (reconciler, _, _) = test_reconciler(MockClusterClient::new());
        let err = ControllerError::from(ClusterError::Conflict("stale".to_string()));
        assert_eq!(reconciler.error_action("ng/worker", &err), Action::requeue(CONFLICT_REQUEUE));
        assert_eq!(reconciler.error_count("ng/worker"), 0);
    }

    #[test]
    fn test_transient_errors_back_off_and_reset() {
        let (reconciler, _, _) = test_reconciler(MockClusterClient::new());
        let err = ControllerError::Watch("connection reset".to_string());
        assert_eq!(reconciler.error_action("ng/worker", &err), Action::requeue(Duration::from_secs(5)));
        assert_eq!(reconciler.error_action("ng/worker", &err), Action::requeue(Duration::from_secs(5)));
        assert_eq!(reconciler.error_action("ng/worker", &err), Action::requeue(Duration::from_secs(10)));
        assert_eq!(reconciler.error_count("ng/worker"), 3);

        reconciler.reset_error("ng/worker");
        assert_eq!(reconciler.error_count("ng/worker"), 0);
        assert!(!reconciler.backoff_states.lock().unwrap().contains_key("ng/worker"));
        assert_eq!(reconciler.error_action("ng/worker", &err), Action::requeue(Duration::from_secs(5)));
    }

    #[test]
    fn test_invalid_object_waits_for_change() {
        let (reconciler, _, _) = test_reconciler(MockClusterClient::new());
        let err = ControllerError::InvalidObject("spec.replicas is not an integer".to_string());
        assert_eq!(reconciler.error_action("ng/worker", &err), Action::await_change());
    }

    #[test]
    fn test_event_dedup_per_node_group() {
        let (reconciler, _, _) = test_reconciler(MockClusterClient::new());
        assert!(reconciler.remember_event("ng1", "boom"));
        assert!(!reconciler.remember_event("ng1", "boom"));
        assert!(reconciler.remember_event("ng2", "boom"));
        assert!(reconciler.remember_event("ng1", "other"));
        assert!(reconciler.remember_event("ng1", "boom"));
    }
}
