//! Command line configuration.

use crate::error::ControllerError;
use clap::Parser;
use crds::well_known::DEFAULT_MACHINE_NAMESPACE;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Node manager controller
#[derive(Debug, Clone, Parser)]
#[command(name = "node-manager-controller", version, about)]
pub struct Args {
    /// Reconcilers to run: `*` for all, `-Name` to disable one
    #[arg(long, env = "CONTROLLERS", default_value = "*")]
    pub controllers: String,

    /// Max concurrent reconciles per reconciler
    #[arg(long, env = "WORKERS", default_value_t = 3)]
    pub workers: u16,

    /// Event debounce window in seconds
    #[arg(long, env = "DEBOUNCE_SECONDS", default_value_t = 1)]
    pub debounce_seconds: u64,

    /// Enable Lease based leader election
    #[arg(long, env = "LEADER_ELECT", default_value_t = false)]
    pub leader_elect: bool,

    /// Lease name used for leader election
    #[arg(long, env = "LEADER_ELECTION_ID", default_value = "node-controller-leader")]
    pub leader_election_id: String,

    /// Namespace of the leader election Lease
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE", default_value = DEFAULT_MACHINE_NAMESPACE)]
    pub leader_election_namespace: String,

    /// Namespace holding Machines, MachineDeployments and the checksum Secret
    #[arg(long, env = "MACHINE_NAMESPACE", default_value = DEFAULT_MACHINE_NAMESPACE)]
    pub machine_namespace: String,

    /// Address for /metrics, /healthz and /readyz
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub metrics_bind_address: String,

    /// Node hosting the platform controller; kept schedulable while its group is small
    #[arg(long, env = "DECKHOUSE_NODE_NAME")]
    pub controller_node_name: Option<String>,
}

impl Args {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_seconds)
    }

    /// Validates flag combinations that clap cannot express.
    pub fn validate(&self) -> Result<ControllerSet, ControllerError> {
        if self.workers == 0 {
            return Err(ControllerError::InvalidConfig("--workers must be at least 1".to_string()));
        }
        if self.machine_namespace.is_empty() {
            return Err(ControllerError::InvalidConfig("--machine-namespace must not be empty".to_string()));
        }
        self.controllers.parse()
    }
}

/// Individually switchable reconcilers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ControllerName {
    NodeGroupStatus,
    UpdateApproval,
    Instance,
    Node,
    Machine,
}

impl ControllerName {
    pub const ALL: [Self; 5] = [
        Self::NodeGroupStatus,
        Self::UpdateApproval,
        Self::Instance,
        Self::Node,
        Self::Machine,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NodeGroupStatus => "NodeGroupStatus",
            Self::UpdateApproval => "UpdateApproval",
            Self::Instance => "Instance",
            Self::Node => "Node",
            Self::Machine => "Machine",
        }
    }
}

impl fmt::Display for ControllerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControllerName {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ControllerError::InvalidConfig(format!("unknown controller name {s:?}")))
    }
}

/// The reconcilers enabled by `--controllers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSet(BTreeSet<ControllerName>);

impl ControllerSet {
    pub fn contains(&self, name: ControllerName) -> bool {
        self.0.contains(&name)
    }

    pub fn iter(&self) -> impl Iterator<Item = ControllerName> + '_ {
        self.0.iter().copied()
    }
}

impl FromStr for ControllerSet {
    type Err = ControllerError;

    /// Items are applied left to right, so `*,-Node` enables all but Node.
    /// A list made only of disables starts from the full set.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let items: Vec<&str> = s.split(',').map(str::trim).filter(|i| !i.is_empty()).collect();
        if items.is_empty() {
            return Err(ControllerError::InvalidConfig("--controllers must not be empty".to_string()));
        }

        let mut enabled = BTreeSet::new();
        if items.iter().all(|i| i.starts_with('-')) {
            enabled.extend(ControllerName::ALL);
        }
        for item in items {
            if item == "*" {
                enabled.extend(ControllerName::ALL);
            } else if let Some(disabled) = item.strip_prefix('-') {
                enabled.remove(&disabled.parse()?);
            } else {
                enabled.insert(item.parse()?);
            }
        }
        Ok(Self(enabled))
    }
}
