//! The two machine APIs a NodeGroup can be backed by.

use kube::api::{ApiResource, GroupVersionKind};

/// Machine API flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MachineKind {
    /// Legacy per-machine API (`machine.sapcloud.io/v1alpha1`)
    Mcm,
    /// Cluster lifecycle API (`cluster.x-k8s.io/v1beta1`)
    Capi,
}

impl MachineKind {
    /// Every supported flavour.
    pub const ALL: [Self; 2] = [Self::Mcm, Self::Capi];

    /// `group/version` of the flavour.
    #[must_use]
    pub fn api_version(self) -> &'static str {
        match self {
            Self::Mcm => "machine.sapcloud.io/v1alpha1",
            Self::Capi => "cluster.x-k8s.io/v1beta1",
        }
    }

    fn group_version(self) -> (&'static str, &'static str) {
        match self {
            Self::Mcm => ("machine.sapcloud.io", "v1alpha1"),
            Self::Capi => ("cluster.x-k8s.io", "v1beta1"),
        }
    }

    /// Short name for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mcm => "mcm",
            Self::Capi => "capi",
        }
    }

    /// Resolves the flavour of an object from its `apiVersion`.
    #[must_use]
    pub fn from_api_version(api_version: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.api_version() == api_version)
    }

    /// Dynamic resource descriptor for the flavour's `Machine`.
    #[must_use]
    pub fn machine_resource(self) -> ApiResource {
        let (group, version) = self.group_version();
        ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(group, version, "Machine"), "machines")
    }

    /// Dynamic resource descriptor for the flavour's `MachineDeployment`.
    #[must_use]
    pub fn deployment_resource(self) -> ApiResource {
        let (group, version) = self.group_version();
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk(group, version, "MachineDeployment"),
            "machinedeployments",
        )
    }
}
