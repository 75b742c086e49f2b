//! Main controller implementation.
//!
//! The `Controller` wires the cluster client, event publisher and reconciler
//! together and spawns one watcher task per enabled reconciler.

use crate::config::{Args, ControllerName, ControllerSet};
use crate::error::ControllerError;
use crate::events::KubeEventPublisher;
use crate::reconciler::{Reconciler, Settings};
use crate::watcher::Watcher;
use cluster_client::{KubeClusterClient, MachineKind};
use futures::future::select_all;
use kube::Client;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

type WatcherHandle = JoinHandle<Result<(), ControllerError>>;

/// Main controller for NodeGroups, Instances, Nodes and Machines.
pub struct Controller {
    watchers: Vec<(String, WatcherHandle)>,
}

impl Controller {
    /// Spawns the watchers of every reconciler in `enabled`.
    pub fn new(client: Client, args: &Args, enabled: &ControllerSet) -> Self {
        info!(controllers = ?enabled.iter().map(ControllerName::as_str).collect::<Vec<_>>(), "Initializing controller");

        let events = Arc::new(KubeEventPublisher::new(client.clone(), std::env::var("POD_NAME").ok()));
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(KubeClusterClient::new(client.clone())),
            events,
            Settings {
                machine_namespace: args.machine_namespace.clone(),
                controller_node_name: args.controller_node_name.clone(),
            },
        ));
        let watcher = Arc::new(Watcher::new(
            reconciler,
            client,
            args.machine_namespace.clone(),
            args.workers,
            args.debounce(),
        ));

        let mut watchers = Vec::new();
        for name in enabled.iter() {
            match name {
                ControllerName::NodeGroupStatus => {
                    let watcher = Arc::clone(&watcher);
                    watchers.push((name.to_string(), tokio::spawn(async move { watcher.watch_node_group_status().await })));
                }
                ControllerName::UpdateApproval => {
                    let watcher = Arc::clone(&watcher);
                    watchers.push((name.to_string(), tokio::spawn(async move { watcher.watch_update_approval().await })));
                }
                ControllerName::Instance => {
                    let watcher = Arc::clone(&watcher);
                    watchers.push((name.to_string(), tokio::spawn(async move { watcher.watch_instances().await })));
                }
                ControllerName::Node => {
                    let watcher = Arc::clone(&watcher);
                    watchers.push((name.to_string(), tokio::spawn(async move { watcher.watch_nodes().await })));
                }
                ControllerName::Machine => {
                    for kind in MachineKind::ALL {
                        let watcher = Arc::clone(&watcher);
                        watchers.push((
                            format!("{name}/{}", kind.api_version()),
                            tokio::spawn(async move { watcher.watch_machines(kind).await }),
                        ));
                    }
                }
            }
        }

        Self { watchers }
    }

    /// Runs until the first watcher exits; watchers are expected to run forever.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!(watchers = self.watchers.len(), "Controller running");
        if self.watchers.is_empty() {
            return std::future::pending().await;
        }

        let (names, handles): (Vec<_>, Vec<_>) = self.watchers.into_iter().unzip();
        let (result, index, rest) = select_all(handles).await;
        for handle in rest {
            handle.abort();
        }
        let name = &names[index];
        result
            .map_err(|e| ControllerError::Watch(format!("{name} watcher panicked: {e}")))?
            .map_err(|e| ControllerError::Watch(format!("{name} watcher error: {e}")))?;
        Err(ControllerError::Watch(format!("{name} watcher stopped")))
    }
}
