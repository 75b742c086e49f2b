//! Machine adapter
//!
//! Presents legacy and cluster-lifecycle Machines through one record so the
//! reconcilers never branch on the machine API they are looking at.

use crate::error::ControllerError;
use crate::unstructured::{nested, nested_i64, nested_map, nested_slice, nested_str, str_or_empty};
use chrono::{DateTime, Utc};
use cluster_client::MachineKind;
use crds::well_known::{CAPI_NODE_GROUP_LABEL, NODE_GROUP_LABEL};
use crds::{Condition, ConditionStatus, InstancePhase, LastOperation, MachineRef, MachineStatus, MACHINE_READY_CONDITION};
use kube::api::DynamicObject;
use serde_json::Value;

/// Message carried by legacy machines, whose status is mirrored rather than derived.
pub const LEGACY_PLACEHOLDER_MESSAGE: &str = "adapter not implemented";

/// Legacy machines report this while creating; it is not worth surfacing.
pub const CREATION_STARTED_DESCRIPTION: &str = "Started Machine creation process";

/// Condition reasons that mean node drain is blocking deletion.
const DRAIN_BLOCKED_REASONS: [&str; 2] = ["DrainingFailed", "DrainingNode"];

const SHORT_DESCRIPTION_MAX_CHARS: usize = 200;

/// Lower is more relevant when several conditions carry a message.
fn condition_priority(type_: &str) -> u32 {
    match type_ {
        "InfrastructureReady" => 0,
        "BootstrapReady" | "Deleting" => 1,
        "Ready" => 2,
        "NodeHealthy" => 3,
        "DrainingSucceeded" => 4,
        "VolumeDetachSucceeded" => 5,
        "PreDrainDeleteHookSucceeded" => 6,
        "PreTerminateDeleteHookSucceeded" => 7,
        _ => 100,
    }
}

/// Cuts `message` to a table-friendly length, dropping trailing separators.
pub fn short_description(message: &str) -> String {
    let trim = |s: &str| {
        let s = s.trim_end_matches([' ', '\t', '\r', '\n']);
        s.strip_suffix(['-', ':']).unwrap_or(s).to_string()
    };
    if message.chars().count() <= SHORT_DESCRIPTION_MAX_CHARS {
        return trim(message);
    }
    let head: String = message.chars().take(SHORT_DESCRIPTION_MAX_CHARS - 3).collect();
    trim(&format!("{head}..."))
}

fn parse_time(value: &Value, path: &[&str]) -> Result<Option<DateTime<Utc>>, ControllerError> {
    nested_str(value, path)?
        .filter(|raw| !raw.is_empty())
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| ControllerError::InvalidObject(format!("{} {raw:?}: {e}", path.join("."))))
        })
        .transpose()
}

fn join_non_empty(parts: &[&str]) -> String {
    parts.iter().filter(|p| !p.is_empty()).copied().collect::<Vec<_>>().join(": ")
}

/// Normalized view over either machine API.
#[derive(Debug, Clone, PartialEq)]
pub struct Machine {
    pub name: String,
    pub namespace: String,
    pub kind: MachineKind,
    pub node_name: Option<String>,
    pub node_group: Option<String>,
    pub deleting: bool,
    observed: Observed,
}

/// Source fields the status derivation works from.
#[derive(Debug, Clone, PartialEq)]
enum Observed {
    Legacy {
        phase: String,
        last_update_time: Option<DateTime<Utc>>,
        last_operation: Option<LastOperation>,
    },
    Capi {
        phase: String,
        conditions: Vec<SourceCondition>,
        observed_generation: Option<i64>,
        last_updated: Option<DateTime<Utc>>,
        drain_started: Option<DateTime<Utc>>,
        /// `failureReason: failureMessage`, empty when neither is set
        failure: String,
    },
}

/// A failure reported by a cluster-lifecycle Machine.
#[derive(Debug, Clone, PartialEq)]
struct MachineError {
    description: String,
    last_update_time: Option<DateTime<Utc>>,
}

/// Node drain observed on a deleting Machine.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Draining {
    since: Option<DateTime<Utc>>,
}

/// A condition as found on a cluster-lifecycle Machine.
#[derive(Debug, Clone, PartialEq)]
struct SourceCondition {
    type_: String,
    status: ConditionStatus,
    reason: String,
    message: String,
    severity: String,
    last_transition_time: Option<DateTime<Utc>>,
    observed_generation: Option<i64>,
}

/// Fine-grained machine state, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    InfraWait,
    InfraProblem,
    Blocked,
    Deleting,
    Ready,
    Progressing,
}

impl MachineState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InfraWait => "InfraWait",
            Self::InfraProblem => "InfraProblem",
            Self::Blocked => "Blocked",
            Self::Deleting => "Deleting",
            Self::Ready => "Ready",
            Self::Progressing => "Progressing",
        }
    }

    /// Coarse status surfaced on the Instance.
    pub fn coarse(self) -> MachineStatus {
        match self {
            Self::InfraProblem => MachineStatus::Error,
            Self::Blocked => MachineStatus::Blocked,
            Self::Ready => MachineStatus::Ready,
            Self::InfraWait | Self::Deleting | Self::Progressing => MachineStatus::Progressing,
        }
    }
}

/// Status derived from a Machine, ready to be written to its Instance.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedStatus {
    pub phase: InstancePhase,
    /// Time the machine entered `phase`; `None` means now
    pub phase_time: Option<DateTime<Utc>>,
    pub machine_status: MachineStatus,
    pub last_operation: Option<LastOperation>,
    pub message: String,
    /// `MachineReady` condition; absent for legacy machines
    pub condition: Option<Condition>,
}

impl Machine {
    /// Normalizes an untyped Machine object.
    pub fn from_object(obj: &DynamicObject) -> Result<Self, ControllerError> {
        let api_version = obj.types.as_ref().map(|t| t.api_version.as_str()).unwrap_or_default();
        let kind = MachineKind::from_api_version(api_version)
            .ok_or_else(|| ControllerError::UnsupportedMachineKind(api_version.to_string()))?;
        if let Some(t) = obj.types.as_ref().filter(|t| t.kind != "Machine") {
            return Err(ControllerError::UnsupportedMachineKind(format!("{}/{}", api_version, t.kind)));
        }

        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| ControllerError::InvalidObject("machine without a name".to_string()))?;
        let namespace = obj.metadata.namespace.clone().unwrap_or_default();
        let labels = obj.metadata.labels.clone().unwrap_or_default();
        let data = &obj.data;
        let non_empty = |s: Option<&str>| s.filter(|s| !s.is_empty()).map(str::to_string);

        let (node_name, node_group, observed) = match kind {
            MachineKind::Mcm => {
                let template_group = nested_map(data, &["spec", "nodeTemplate", "metadata", "labels"])?
                    .and_then(|l| l.get(NODE_GROUP_LABEL))
                    .and_then(Value::as_str);
                let node_name = non_empty(nested_str(data, &["status", "node"])?)
                    .or_else(|| labels.get("node").cloned());
                let phase = str_or_empty(data, &["status", "currentStatus", "phase"])?.to_string();
                let last_update_time = parse_time(data, &["status", "currentStatus", "lastUpdateTime"])?;
                let last_operation = match nested(data, &["status", "lastOperation"]) {
                    Some(op) => {
                        let description = str_or_empty(op, &["description"])?;
                        Some(LastOperation {
                            description: description.to_string(),
                            short_description: short_description(description),
                            type_: str_or_empty(op, &["type"])?.to_string(),
                            state: str_or_empty(op, &["state"])?.to_string(),
                            last_update_time: parse_time(op, &["lastUpdateTime"])?,
                        })
                    }
                    None => None,
                };
                let observed = Observed::Legacy { phase, last_update_time, last_operation };
                (node_name, non_empty(template_group), observed)
            }
            MachineKind::Capi => {
                let group = labels
                    .get(CAPI_NODE_GROUP_LABEL)
                    .or_else(|| labels.get(NODE_GROUP_LABEL))
                    .cloned();
                let node_name = non_empty(nested_str(data, &["status", "nodeRef", "name"])?);
                let phase = str_or_empty(data, &["status", "phase"])?.to_string();
                let conditions = nested_slice(data, &["status", "conditions"])?
                    .iter()
                    .map(SourceCondition::parse)
                    .collect::<Result<Vec<_>, _>>()?;
                let observed_generation = nested_i64(data, &["status", "observedGeneration"])?;
                let failure = join_non_empty(&[
                    str_or_empty(data, &["status", "failureReason"])?,
                    str_or_empty(data, &["status", "failureMessage"])?,
                ]);
                let observed = Observed::Capi {
                    phase,
                    conditions,
                    observed_generation,
                    last_updated: parse_time(data, &["status", "lastUpdated"])?,
                    drain_started: parse_time(data, &["status", "deletion", "nodeDrainStartTime"])?,
                    failure,
                };
                (node_name, group, observed)
            }
        };

        Ok(Self {
            name,
            namespace,
            kind,
            node_name,
            node_group,
            deleting: obj.metadata.deletion_timestamp.is_some(),
            observed,
        })
    }

    /// Reference stored in the Instance's `spec.machineRef`.
    pub fn machine_ref(&self) -> MachineRef {
        MachineRef {
            kind: "Machine".to_string(),
            api_version: self.kind.api_version().to_string(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self.observed, Observed::Legacy { .. })
    }

    /// Fine-grained state; legacy machines always report `Progressing`.
    pub fn state(&self) -> MachineState {
        self.classify().0
    }

    /// State plus the source condition that decided it.
    fn classify(&self) -> (MachineState, Option<&SourceCondition>) {
        let Observed::Capi { phase, conditions, .. } = &self.observed else {
            return (MachineState::Progressing, None);
        };
        let find = |t: &str| conditions.iter().find(|c| c.type_ == t);

        if let Some(infra) = find("InfrastructureReady").filter(|c| c.status == ConditionStatus::False) {
            let waiting = matches!(phase.as_str(), "Pending" | "Provisioning") && infra.severity != "Error";
            let state = if waiting { MachineState::InfraWait } else { MachineState::InfraProblem };
            return (state, Some(infra));
        }

        if let Some(deleting) = find("Deleting").filter(|c| c.status == ConditionStatus::True) {
            let blocked = DRAIN_BLOCKED_REASONS.contains(&deleting.reason.as_str()) && !deleting.message.is_empty();
            let state = if blocked { MachineState::Blocked } else { MachineState::Deleting };
            return (state, Some(deleting));
        }

        if let Some(ready) = find("Ready") {
            if ready.status == ConditionStatus::True {
                return (MachineState::Ready, Some(ready));
            }
            return (MachineState::Progressing, Some(ready));
        }

        (MachineState::Progressing, None)
    }

    /// Failure reported through an error-severity condition or the
    /// failure fields; legacy machines report theirs through the phase.
    fn error(&self) -> Option<MachineError> {
        let Observed::Capi { conditions, last_updated, failure, .. } = &self.observed else {
            return None;
        };
        let failed = conditions
            .iter()
            .filter(|c| c.status == ConditionStatus::False && c.severity == "Error")
            .fold(None::<&SourceCondition>, |best, c| match best {
                Some(b) if condition_priority(&b.type_) <= condition_priority(&c.type_) => Some(b),
                _ => Some(c),
            });
        if let Some(c) = failed {
            return Some(MachineError {
                description: join_non_empty(&[&c.type_, &c.reason, &c.message]),
                last_update_time: c.last_transition_time.or(*last_updated),
            });
        }
        (!failure.is_empty()).then(|| MachineError {
            description: failure.clone(),
            last_update_time: *last_updated,
        })
    }

    /// Drain in progress on a cluster-lifecycle Machine. A settled
    /// `DrainingSucceeded` condition decides; otherwise any drain-related
    /// condition, then the drain start time.
    fn draining(&self) -> Option<Draining> {
        let Observed::Capi { conditions, drain_started, .. } = &self.observed else {
            return None;
        };
        if let Some(c) = conditions.iter().find(|c| c.type_ == "DrainingSucceeded") {
            return (c.status != ConditionStatus::True).then_some(Draining { since: c.last_transition_time });
        }
        let drain_related = |c: &&SourceCondition| {
            c.reason.starts_with("Draining") || c.message.to_lowercase().contains("drain")
        };
        if let Some(c) = conditions.iter().find(drain_related) {
            return Some(Draining { since: c.last_transition_time });
        }
        drain_started.map(|t| Draining { since: Some(t) })
    }

    /// Condition whose message best explains the machine's state.
    fn message_condition(&self) -> Option<&SourceCondition> {
        let Observed::Capi { conditions, .. } = &self.observed else {
            return None;
        };
        conditions
            .iter()
            .filter(|c| !c.message.is_empty())
            .fold(None::<&SourceCondition>, |best, c| match best {
                Some(b) => {
                    let (bp, cp) = (condition_priority(&b.type_), condition_priority(&c.type_));
                    if cp < bp || (cp == bp && c.last_transition_time > b.last_transition_time) {
                        Some(c)
                    } else {
                        Some(b)
                    }
                }
                None => Some(c),
            })
    }

    /// Instance phase and the time it was entered.
    ///
    /// Deletion of either side wins over everything else, then a reported
    /// failure, then the machine's own phase.
    fn resolve_phase(&self, instance_deleting: bool) -> (InstancePhase, Option<DateTime<Utc>>) {
        let (raw, since) = match &self.observed {
            Observed::Legacy { phase, last_update_time, .. } => (phase, *last_update_time),
            Observed::Capi { phase, last_updated, .. } => (phase, *last_updated),
        };
        let phase = InstancePhase::from_machine_phase(raw);

        if instance_deleting || self.deleting || phase.is_deletion() {
            if let Some(draining) = self.draining() {
                return (InstancePhase::Draining, draining.since);
            }
            if !phase.is_deletion() {
                return (InstancePhase::Terminating, None);
            }
            return (phase, since);
        }

        match self.error() {
            Some(error) if !phase.is_failure() => (InstancePhase::Failed, error.last_update_time),
            _ => (phase, since),
        }
    }

    fn last_operation(&self, phase: InstancePhase) -> Option<LastOperation> {
        if let Observed::Legacy { last_operation, .. } = &self.observed {
            return last_operation.clone();
        }
        if let Some(error) = self.error() {
            return Some(LastOperation {
                short_description: short_description(&error.description),
                description: error.description,
                type_: "HealthCheck".to_string(),
                state: "Failed".to_string(),
                last_update_time: error.last_update_time,
            });
        }
        self.message_condition().map(|c| LastOperation {
            description: c.message.clone(),
            short_description: short_description(&c.message),
            type_: if phase == InstancePhase::Draining { "Delete" } else { "HealthCheck" }.to_string(),
            state: if phase == InstancePhase::Failed { "Failed" } else { "Processing" }.to_string(),
            last_update_time: c.last_transition_time,
        })
    }

    /// Derives the Instance status for this machine.
    pub fn status(&self, instance_deleting: bool) -> DerivedStatus {
        let (phase, phase_time) = self.resolve_phase(instance_deleting);
        let last_operation = self.last_operation(phase);
        match &self.observed {
            Observed::Legacy { .. } => DerivedStatus {
                phase,
                phase_time,
                machine_status: MachineStatus::Progressing,
                last_operation,
                message: LEGACY_PLACEHOLDER_MESSAGE.to_string(),
                condition: None,
            },
            Observed::Capi { observed_generation, .. } => {
                let (state, source) = self.classify();
                let message = source.map(|c| c.message.clone()).unwrap_or_default();
                let condition = Condition {
                    type_: MACHINE_READY_CONDITION.to_string(),
                    status: ConditionStatus::from_bool(state == MachineState::Ready),
                    reason: state.as_str().to_string(),
                    message: message.clone(),
                    last_transition_time: source.and_then(|c| c.last_transition_time),
                    observed_generation: source.and_then(|c| c.observed_generation).or(*observed_generation),
                };
                DerivedStatus {
                    phase,
                    phase_time,
                    machine_status: state.coarse(),
                    last_operation,
                    message,
                    condition: Some(condition),
                }
            }
        }
    }
}

impl SourceCondition {
    fn parse(value: &Value) -> Result<Self, ControllerError> {
        Ok(Self {
            type_: str_or_empty(value, &["type"])?.to_string(),
            status: ConditionStatus::parse(str_or_empty(value, &["status"])?),
            reason: str_or_empty(value, &["reason"])?.to_string(),
            message: str_or_empty(value, &["message"])?.to_string(),
            severity: str_or_empty(value, &["severity"])?.to_string(),
            last_transition_time: parse_time(value, &["lastTransitionTime"])?,
            observed_generation: nested_i64(value, &["observedGeneration"])?,
        })
    }
}
