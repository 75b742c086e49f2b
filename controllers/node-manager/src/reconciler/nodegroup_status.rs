//! NodeGroup status reconciler
//!
//! Computes `NodeGroup.status` from the group's Nodes, Machines and
//! MachineDeployments, the configuration checksum and the zone discovery
//! Secret. The status is written only when it differs from what is stored.

use super::conditions::{ERROR, GroupView, NodeView, calculate_conditions, condition_summary};
use super::{Reconciler, object_ref};
use crate::error::ControllerError;
use crate::events::{actions, reasons};
use crate::machine::Machine;
use crate::metrics;
use crate::unstructured::{nested_i64, nested_map, nested_slice, str_or_empty};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use cluster_client::MachineKind;
use crds::well_known::{CLOUD_PROVIDER_SECRET, CLOUD_PROVIDER_SECRET_NAMESPACE};
use crds::{MachineFailure, MachineLastOperation, NodeGroup, NodeGroupStatus, NodeType, find_condition};
use kube::api::DynamicObject;
use kube::runtime::events::EventType;
use kube_runtime::controller::Action;
use serde_json::{Value, json};
use std::collections::BTreeSet;
use tracing::{debug, error, info};

/// Short form written to `status.error` whenever there is something to report.
pub const MACHINE_CREATION_FAILED: &str = "Machine creation failed. Check events for details.";

/// Progress message reported as a normal event rather than a warning.
pub const MACHINE_CREATING: &str = "Started Machine creation process";

const EVENT_MESSAGE_LIMIT: usize = 1024;

/// What the MachineDeployments of one group add up to.
#[derive(Debug, Default)]
struct DeploymentSummary {
    names: BTreeSet<String>,
    replicas: i64,
    frozen: bool,
    failures: Vec<TimedFailure>,
}

#[derive(Debug)]
struct TimedFailure {
    time: Option<DateTime<Utc>>,
    failure: MachineFailure,
}

/// CloudEphemeral-only part of the status.
#[derive(Debug)]
struct CloudState {
    min: i32,
    max: i32,
    desired: i32,
    instances: i32,
    frozen: bool,
    failures: Vec<MachineFailure>,
}

fn clamp(value: i64) -> i32 {
    i32::try_from(value.max(0)).unwrap_or(i32::MAX)
}

/// Cuts `message` to at most `limit` bytes on a character boundary.
fn truncate(message: &str, limit: usize) -> &str {
    if message.len() <= limit {
        return message;
    }
    let mut end = limit;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}

fn latest_description(failures: &[MachineFailure]) -> &str {
    failures
        .last()
        .and_then(|f| f.last_operation.as_ref())
        .map(|op| op.description.as_str())
        .unwrap_or_default()
}

/// The group's own error, as opposed to one derived from machine failures.
///
/// Once rewritten to the short form, the original text only survives in the
/// `Error` condition, next to the machine failure it was reported with.
fn own_error(previous: &NodeGroupStatus) -> String {
    if previous.error != MACHINE_CREATION_FAILED {
        return previous.error.clone();
    }
    let message = find_condition(&previous.conditions, ERROR)
        .filter(|c| c.is_true())
        .map(|c| c.message.as_str())
        .unwrap_or_default();
    let previous_failure = previous.last_machine_failures.as_deref().map(latest_description).unwrap_or_default();
    if previous_failure.is_empty() {
        return message.to_string();
    }
    if message == previous_failure {
        return String::new();
    }
    message
        .strip_suffix(previous_failure)
        .and_then(|m| m.strip_suffix('|'))
        .unwrap_or(message)
        .to_string()
}

/// Reads replicas, the frozen flag and failed machines of one MachineDeployment.
fn read_deployment(md: &DynamicObject, summary: &mut DeploymentSummary) -> Result<(), ControllerError> {
    let data = &md.data;
    summary.replicas += nested_i64(data, &["spec", "replicas"])?.unwrap_or(0);

    for condition in nested_slice(data, &["status", "conditions"])? {
        if str_or_empty(condition, &["type"])? == "Frozen" && str_or_empty(condition, &["status"])? == "True" {
            summary.frozen = true;
        }
    }

    for item in nested_slice(data, &["status", "failedMachines"])? {
        if !item.is_object() {
            return Err(ControllerError::InvalidObject(
                "status.failedMachines entries must be objects".to_string(),
            ));
        }
        let last_operation = nested_map(item, &["lastOperation"])?.map(|m| Value::Object(m.clone()));
        let description = match &last_operation {
            Some(op) => str_or_empty(op, &["description"])?.to_string(),
            None => String::new(),
        };
        if description.is_empty() {
            continue;
        }
        let (raw_time, state, type_) = match &last_operation {
            Some(op) => (
                str_or_empty(op, &["lastUpdateTime"])?.to_string(),
                str_or_empty(op, &["state"])?.to_string(),
                str_or_empty(op, &["type"])?.to_string(),
            ),
            None => (String::new(), String::new(), String::new()),
        };
        let time = DateTime::parse_from_rfc3339(&raw_time).ok().map(|t| t.with_timezone(&Utc));
        let last_update_time = time.map_or(raw_time, |t| t.to_rfc3339_opts(SecondsFormat::Secs, true));

        summary.failures.push(TimedFailure {
            time,
            failure: MachineFailure {
                name: str_or_empty(item, &["name"])?.to_string(),
                provider_id: str_or_empty(item, &["providerID"])?.to_string(),
                owner_ref: str_or_empty(item, &["ownerRef"])?.to_string(),
                last_operation: Some(MachineLastOperation {
                    description,
                    last_update_time,
                    state,
                    type_,
                }),
            },
        });
    }
    Ok(())
}

impl Reconciler {
    pub async fn reconcile_node_group_status(&self, name: &str) -> Result<Action, ControllerError> {
        let Some(ng) = self.client.get_node_group(name).await? else {
            debug!(node_group = %name, "NodeGroup is gone");
            metrics::forget_node_group(name);
            self.forget_event(name);
            return Ok(Action::await_change());
        };

        // Gather nodes and the expected configuration checksum
        let nodes = self.client.list_nodes_in_group(name).await?;
        let checksum = self.group_checksum(name).await?;
        let views: Vec<NodeView> = nodes.iter().map(NodeView::from_node).collect();
        let previous = ng.status.clone().unwrap_or_default();

        // Cloud groups also need their MachineDeployments and zones
        let cloud = if ng.spec.node_type == NodeType::CloudEphemeral {
            match self.cloud_state(&ng).await {
                Ok(state) => Some(state),
                Err(e) if e.is_invalid_object() => return self.report_invalid(&ng, &previous, &e).await,
                Err(e) => return Err(e),
            }
        } else {
            metrics::observe_machine_deployments(name, &BTreeSet::new());
            None
        };

        // Machine failures become an event and the error field
        let md_error = cloud.as_ref().map(|c| latest_description(&c.failures)).unwrap_or_default();
        let own = own_error(&previous);
        let condition_errors: Vec<String> = [own.as_str(), md_error]
            .into_iter()
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .collect();

        let combined = format!("{own} {md_error}");
        let event_message = truncate(combined.trim(), EVENT_MESSAGE_LIMIT);
        let error = if event_message.is_empty() {
            String::new()
        } else {
            self.emit_machine_event(&ng, event_message).await;
            MACHINE_CREATION_FAILED.to_string()
        };

        // Compute conditions and counters, then write only on change
        let group = GroupView {
            node_type: ng.spec.node_type,
            checksum: checksum.clone(),
            desired: cloud.as_ref().map_or(0, |c| c.desired),
            instances: cloud.as_ref().map_or(0, |c| c.instances),
            frozen: cloud.as_ref().is_some_and(|c| c.frozen),
            generation: ng.metadata.generation,
        };
        let conditions = calculate_conditions(
            &group,
            &views,
            &previous.conditions,
            &condition_errors,
            Utc::now().trunc_subsecs(0),
        );

        let count = |n: usize| i32::try_from(n).unwrap_or(i32::MAX);
        let up_to_date = if checksum.is_empty() {
            0
        } else {
            count(views.iter().filter(|v| v.checksum.as_deref() == Some(checksum.as_str())).count())
        };

        let mut status = NodeGroupStatus {
            nodes: count(views.len()),
            ready: count(views.iter().filter(|v| v.ready).count()),
            up_to_date,
            conditions,
            condition_summary: Some(condition_summary(&error)),
            error,
            ..Default::default()
        };
        if let Some(cloud) = cloud {
            status.desired = cloud.desired;
            status.min = cloud.min;
            status.max = cloud.max;
            status.instances = cloud.instances;
            status.last_machine_failures = Some(cloud.failures);
        }

        if status == previous {
            debug!(node_group = %name, "Status unchanged");
            return Ok(Action::await_change());
        }
        self.write_status(&ng, &status).await?;
        debug!(
            node_group = %name,
            nodes = status.nodes,
            ready = status.ready,
            up_to_date = status.up_to_date,
            "Updated NodeGroup status"
        );
        Ok(Action::await_change())
    }

    async fn write_status(&self, ng: &NodeGroup, status: &NodeGroupStatus) -> Result<(), ControllerError> {
        let name = ng.metadata.name.clone().unwrap_or_default();
        let patch = json!({
            "metadata": { "resourceVersion": ng.metadata.resource_version },
            "status": status,
        });
        self.client.patch_node_group_status(&name, &patch).await?;
        Ok(())
    }

    /// Surfaces a malformed MachineDeployment on the group and waits for the next change.
    async fn report_invalid(&self, ng: &NodeGroup, previous: &NodeGroupStatus, e: &ControllerError) -> Result<Action, ControllerError> {
        let name = ng.metadata.name.clone().unwrap_or_default();
        error!(node_group = %name, error = %e, "Malformed MachineDeployment");
        let reason = e.to_string();
        let mut status = previous.clone();
        status.condition_summary = Some(condition_summary(&reason));
        status.error = reason;
        if status != *previous {
            self.write_status(ng, &status).await?;
        }
        Ok(Action::await_change())
    }

    async fn emit_machine_event(&self, ng: &NodeGroup, message: &str) {
        let name = ng.metadata.name.clone().unwrap_or_default();
        if !self.remember_event(&name, message) {
            return;
        }
        let (type_, reason) = if message == MACHINE_CREATING {
            (EventType::Normal, reasons::MACHINE_CREATING)
        } else {
            (EventType::Warning, reasons::MACHINE_FAILED)
        };
        info!(node_group = %name, reason, "Reporting machine event");
        self.events
            .publish(&object_ref(ng), type_, reason, actions::RECONCILE, Some(message.to_string()))
            .await;
    }

    /// Number of zones machines are spread over.
    async fn zones_count(&self, ng: &NodeGroup) -> Result<i64, ControllerError> {
        if let Some(zones) = ng.spec.cloud_instances.as_ref().map(|c| &c.zones).filter(|z| !z.is_empty()) {
            return Ok(i64::try_from(zones.len()).unwrap_or(1));
        }
        let secret = self
            .client
            .get_secret(CLOUD_PROVIDER_SECRET_NAMESPACE, CLOUD_PROVIDER_SECRET)
            .await?;
        let discovered = secret
            .and_then(|s| s.data)
            .and_then(|d| d.get("zones").cloned())
            .and_then(|raw| serde_json::from_slice::<Vec<String>>(&raw.0).ok())
            .map_or(0, |zones| zones.len());
        Ok(if discovered == 0 { 1 } else { i64::try_from(discovered).unwrap_or(1) })
    }

    async fn cloud_state(&self, ng: &NodeGroup) -> Result<CloudState, ControllerError> {
        let name = ng.metadata.name.clone().unwrap_or_default();
        let namespace = &self.settings.machine_namespace;

        let zones = self.zones_count(ng).await?;
        let (min_per_zone, max_per_zone) = ng
            .spec
            .cloud_instances
            .as_ref()
            .map_or((0, 0), |c| (i64::from(c.min_per_zone), i64::from(c.max_per_zone)));
        let min = min_per_zone * zones;
        let max = max_per_zone * zones;

        let mut summary = DeploymentSummary::default();
        for kind in MachineKind::ALL {
            for md in self.client.list_machine_deployments(kind, namespace, &name).await? {
                if let Some(md_name) = md.metadata.name.clone() {
                    summary.names.insert(md_name);
                }
                read_deployment(&md, &mut summary)?;
            }
        }
        metrics::observe_machine_deployments(&name, &summary.names);
        summary.failures.sort_by(|a, b| a.time.cmp(&b.time));

        let mut instances = 0;
        for kind in MachineKind::ALL {
            for obj in self.client.list_machines(kind, namespace).await? {
                match Machine::from_object(&obj) {
                    Ok(machine) if machine.node_group.as_deref() == Some(name.as_str()) => instances += 1,
                    Ok(_) => {}
                    Err(e) => debug!(node_group = %name, error = %e, "Skipping unreadable Machine"),
                }
            }
        }

        Ok(CloudState {
            min: clamp(min),
            max: clamp(max),
            desired: clamp(summary.replicas.max(min)),
            instances,
            frozen: summary.frozen,
            failures: summary.failures.into_iter().map(|f| f.failure).collect(),
        })
    }
}
