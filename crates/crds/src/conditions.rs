//! Condition records shared by NodeGroup and Instance status.
//!
//! Mirrors the `metav1.Condition` shape: `type`, `status`, `reason`, `message`,
//! `lastTransitionTime` and `observedGeneration`.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Tri-state condition status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    /// The condition holds
    True,
    /// The condition does not hold
    False,
    /// The state could not be determined
    #[default]
    Unknown,
}

impl ConditionStatus {
    /// Converts a boolean into `True`/`False`.
    #[must_use]
    pub fn from_bool(value: bool) -> Self {
        if value { Self::True } else { Self::False }
    }

    /// Parses the string form used by untyped objects. Anything unrecognised is `Unknown`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "True" => Self::True,
            "False" => Self::False,
            _ => Self::Unknown,
        }
    }
}

/// A single observation of one aspect of an object's state.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. `Ready`
    #[serde(rename = "type")]
    pub type_: String,

    /// Condition status
    pub status: ConditionStatus,

    /// Short CamelCase code for the last transition
    #[serde(default)]
    pub reason: String,

    /// Human readable details
    #[serde(default)]
    pub message: String,

    /// Last time `status` changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    /// Generation of the object the condition was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Builds a condition without timing information.
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: None,
            observed_generation: None,
        }
    }

    /// True when the condition is present with status `True`.
    #[must_use]
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Looks up a condition by type.
#[must_use]
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Keeps `lastTransitionTime` from `previous` when the status did not change,
/// otherwise stamps `now`.
pub fn carry_transition_time(condition: &mut Condition, previous: &[Condition], now: DateTime<Utc>) {
    condition.last_transition_time = match find_condition(previous, &condition.type_) {
        Some(prev) if prev.status == condition.status && prev.last_transition_time.is_some() => {
            prev.last_transition_time
        }
        _ => Some(now),
    };
}
