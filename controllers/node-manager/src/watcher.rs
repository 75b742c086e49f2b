//! Kubernetes resource watchers.
//!
//! Every reconciler runs as a `kube_runtime::Controller` built by one of the
//! `watch_*` methods below; `watch_resource()` wraps the shared parts: debounce
//! and concurrency, metrics, per-key backoff through the reconciler's error
//! policy.

use crate::config::ControllerName;
use crate::error::ControllerError;
use crate::machine::Machine;
use crate::metrics;
use crate::reconciler::Reconciler;
use cluster_client::MachineKind;
use crds::well_known::{
    CAPI_NODE_GROUP_LABEL, CLOUD_PROVIDER_SECRET, CLOUD_PROVIDER_SECRET_NAMESPACE, CONFIGURATION_CHECKSUMS_SECRET,
    NODE_GROUP_LABEL,
};
use crds::{Instance, NodeGroup};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::api::DynamicObject;
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::controller::{self, Action, Config as ControllerConfig};
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::{Controller, watcher};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

type ReconcileFuture = Pin<Box<dyn Future<Output = Result<Action, ControllerError>> + Send>>;

/// Backoff and metrics key of an object.
fn object_key<K: Resource>(controller: ControllerName, obj: &K) -> String {
    let meta = obj.meta();
    match meta.namespace.as_deref() {
        Some(ns) => format!("{}/{}/{}", controller.as_str(), ns, meta.name.as_deref().unwrap_or_default()),
        None => format!("{}/{}", controller.as_str(), meta.name.as_deref().unwrap_or_default()),
    }
}

/// Runs `controller` until its watch streams end.
async fn watch_resource<K, F>(
    controller: Controller<K>,
    reconciler: Arc<Reconciler>,
    name: ControllerName,
    config: ControllerConfig,
    reconcile_fn: F,
) -> Result<(), ControllerError>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Debug + Unpin,
    F: Fn(Arc<Reconciler>, Arc<K>) -> ReconcileFuture + Send + Sync + Clone + 'static,
{
    info!(controller = name.as_str(), "Starting controller");

    let error_policy = move |obj: Arc<K>, error: &ControllerError, ctx: Arc<Reconciler>| {
        ctx.error_action(&object_key(name, obj.as_ref()), error)
    };

    let reconcile = move |obj: Arc<K>, ctx: Arc<Reconciler>| {
        let reconcile_fn = reconcile_fn.clone();
        async move {
            let key = object_key(name, obj.as_ref());
            debug!(key = %key, "Reconciling");
            let started = Instant::now();
            let result = reconcile_fn(ctx.clone(), obj).await;
            metrics::record_reconcile(name.as_str(), started.elapsed(), result.as_ref().err().map(ControllerError::kind));
            if result.is_ok() {
                ctx.reset_error(&key);
            }
            result
        }
    };

    controller
        .with_config(config)
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(controller = name.as_str(), object = %obj.name, "Reconciled"),
                // Already logged by the error policy.
                Err(controller::Error::ReconcilerFailed(_, _)) => {}
                Err(e) => warn!(controller = name.as_str(), error = %e, "Controller error"),
            }
        })
        .await;

    info!(controller = name.as_str(), "Controller stopped");
    Ok(())
}

/// Maps every change to every NodeGroup in `store`.
fn all_node_groups(store: Store<NodeGroup>) -> impl Fn(Secret) -> Vec<ObjectRef<NodeGroup>> + Send + Sync + 'static {
    move |_| store.state().iter().map(|ng| ObjectRef::from_obj(ng.as_ref())).collect()
}

fn node_to_group(node: Node) -> Option<ObjectRef<NodeGroup>> {
    node.labels().get(NODE_GROUP_LABEL).map(|g| ObjectRef::new(g))
}

fn machine_to_group(obj: DynamicObject) -> Option<ObjectRef<NodeGroup>> {
    Machine::from_object(&obj).ok()?.node_group.map(|g| ObjectRef::new(&g))
}

fn deployment_to_group(obj: DynamicObject) -> Option<ObjectRef<NodeGroup>> {
    obj.labels().get(CAPI_NODE_GROUP_LABEL).map(|g| ObjectRef::new(g))
}

fn named_secret(name: &str) -> watcher::Config {
    watcher::Config::default().fields(&format!("metadata.name={name}"))
}

/// Watches Kubernetes resources for changes.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    client: Client,
    machine_namespace: String,
    config: ControllerConfig,
}

impl Watcher {
    pub fn new(reconciler: Arc<Reconciler>, client: Client, machine_namespace: String, workers: u16, debounce: Duration) -> Self {
        Self {
            reconciler,
            client,
            machine_namespace,
            config: ControllerConfig::default().debounce(debounce).concurrency(workers),
        }
    }

    fn machines(&self, kind: MachineKind) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.machine_namespace, &kind.machine_resource())
    }

    fn machine_deployments(&self, kind: MachineKind) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.machine_namespace, &kind.deployment_resource())
    }

    fn checksum_secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.machine_namespace)
    }

    /// NodeGroup status, driven by the group, its nodes, machines and deployments.
    pub async fn watch_node_group_status(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(Api::<NodeGroup>::all(self.client.clone()), watcher::Config::default());
        let store = controller.store();
        let mut controller = controller
            .watches(Api::<Node>::all(self.client.clone()), watcher::Config::default(), node_to_group)
            .watches(
                self.checksum_secrets(),
                named_secret(CONFIGURATION_CHECKSUMS_SECRET),
                all_node_groups(store.clone()),
            )
            .watches(
                Api::<Secret>::namespaced(self.client.clone(), CLOUD_PROVIDER_SECRET_NAMESPACE),
                named_secret(CLOUD_PROVIDER_SECRET),
                all_node_groups(store),
            );
        for kind in MachineKind::ALL {
            controller = controller
                .watches_with(self.machines(kind), kind.machine_resource(), watcher::Config::default(), machine_to_group)
                .watches_with(
                    self.machine_deployments(kind),
                    kind.deployment_resource(),
                    watcher::Config::default(),
                    deployment_to_group,
                );
        }

        watch_resource(
            controller,
            self.reconciler.clone(),
            ControllerName::NodeGroupStatus,
            self.config.clone(),
            |ctx: Arc<Reconciler>, ng: Arc<NodeGroup>| -> ReconcileFuture {
                Box::pin(async move { ctx.reconcile_node_group_status(&ng.name_any()).await })
            },
        )
        .await
    }

    /// Update approval, driven by the group, its nodes and the checksum Secret.
    pub async fn watch_update_approval(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(Api::<NodeGroup>::all(self.client.clone()), watcher::Config::default());
        let store = controller.store();
        let controller = controller
            .watches(
                Api::<Node>::all(self.client.clone()),
                watcher::Config::default().labels(NODE_GROUP_LABEL),
                node_to_group,
            )
            .watches(
                self.checksum_secrets(),
                named_secret(CONFIGURATION_CHECKSUMS_SECRET),
                all_node_groups(store),
            );

        watch_resource(
            controller,
            self.reconciler.clone(),
            ControllerName::UpdateApproval,
            self.config.clone(),
            |ctx: Arc<Reconciler>, ng: Arc<NodeGroup>| -> ReconcileFuture {
                Box::pin(async move { ctx.reconcile_update_approval(&ng.name_any()).await })
            },
        )
        .await
    }

    /// Instances for static nodes.
    pub async fn watch_nodes(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(Api::<Node>::all(self.client.clone()), watcher::Config::default())
            .watches(Api::<Instance>::all(self.client.clone()), watcher::Config::default(), |instance: Instance| {
                Some(ObjectRef::<Node>::new(&instance.name_any()))
            });
        watch_resource(
            controller,
            self.reconciler.clone(),
            ControllerName::Node,
            self.config.clone(),
            |ctx: Arc<Reconciler>, node: Arc<Node>| -> ReconcileFuture {
                Box::pin(async move { ctx.reconcile_node(&node.name_any()).await })
            },
        )
        .await
    }

    /// Instances for the Machines of one API.
    pub async fn watch_machines(&self, kind: MachineKind) -> Result<(), ControllerError> {
        let controller = Controller::new_with(self.machines(kind), watcher::Config::default(), kind.machine_resource());
        watch_resource(
            controller,
            self.reconciler.clone(),
            ControllerName::Machine,
            self.config.clone(),
            move |ctx: Arc<Reconciler>, machine: Arc<DynamicObject>| -> ReconcileFuture {
                Box::pin(async move {
                    let namespace = machine.namespace().unwrap_or_default();
                    ctx.reconcile_machine(kind, &namespace, &machine.name_any()).await
                })
            },
        )
        .await
    }

    /// Deletion cascade, keyed by Instance and driven by same-named Nodes and Machines.
    pub async fn watch_instances(&self) -> Result<(), ControllerError> {
        let same_name = |name: String| Some(ObjectRef::<Instance>::new(&name));
        let mut controller = Controller::new(Api::<Instance>::all(self.client.clone()), watcher::Config::default())
            .watches(Api::<Node>::all(self.client.clone()), watcher::Config::default(), move |node: Node| {
                same_name(node.name_any())
            });
        for kind in MachineKind::ALL {
            controller = controller.watches_with(
                self.machines(kind),
                kind.machine_resource(),
                watcher::Config::default(),
                move |machine: DynamicObject| same_name(machine.name_any()),
            );
        }

        watch_resource(
            controller,
            self.reconciler.clone(),
            ControllerName::Instance,
            self.config.clone(),
            |ctx: Arc<Reconciler>, instance: Arc<Instance>| -> ReconcileFuture {
                Box::pin(async move { ctx.reconcile_instance(&instance.name_any()).await })
            },
        )
        .await
    }
}
