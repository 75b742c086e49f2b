//! Node Manager Controller
//!
//! Keeps NodeGroup status in line with the nodes, Machines and
//! MachineDeployments behind each group, maintains one Instance per node or
//! Machine, and approves configuration updates and disruptions node by node.

mod backoff;
mod config;
mod controller;
mod error;
mod events;
mod leader_election;
mod machine;
mod metrics;
mod reconciler;
mod server;
mod unstructured;
mod watcher;

#[cfg(test)]
mod machine_test;
#[cfg(test)]
mod test_utils;

use crate::config::Args;
use crate::controller::Controller;
use crate::error::ControllerError;
use crate::leader_election::LeaderElector;
use crate::server::Readiness;
use clap::Parser;
use kube::Client;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        eprintln!("rustls crypto provider already installed");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "node_manager_controller=info,kube=warn".into()),
        )
        .init();

    let args = Args::parse();
    let enabled = args.validate()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        machine_namespace = %args.machine_namespace,
        workers = args.workers,
        leader_elect = args.leader_elect,
        "Starting Node Manager Controller"
    );

    metrics::register_metrics().map_err(|e| ControllerError::Server(format!("failed to register metrics: {e}")))?;

    let client = Client::try_default().await?;

    let readiness = Readiness::default();
    let (stop_server, server_stopped) = oneshot::channel::<()>();
    let server = {
        let addr = args.metrics_bind_address.clone();
        let readiness = readiness.clone();
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = server_stopped.await;
            };
            if let Err(e) = server::serve(&addr, readiness, shutdown).await {
                error!(error = %e, "Metrics server failed");
            }
        })
    };

    let mut guard = if args.leader_elect {
        let identity = std::env::var("POD_NAME").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            &args.leader_election_id,
            &args.leader_election_namespace,
            &identity,
        ));
        Some(elector.acquire().await)
    } else {
        None
    };

    let controller = Controller::new(client, &args, &enabled);
    readiness.set_ready(true);

    let leadership_lost = async {
        match guard.as_mut() {
            Some(g) => g.lost().await,
            None => std::future::pending().await,
        }
    };

    let result = tokio::select! {
        () = server::shutdown_signal() => Ok(()),
        () = leadership_lost => {
            Err(ControllerError::LeaderElection("lease lost".to_string()))
        }
        res = controller.run() => res,
    };

    readiness.set_ready(false);
    if let Some(guard) = guard {
        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release lease");
        }
    }
    let _ = stop_server.send(());
    let _ = server.await;

    if let Err(e) = &result {
        error!(error = %e, "Controller exited with error");
    }
    result
}
