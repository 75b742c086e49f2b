//! Controller-specific error types.

use cluster_client::ClusterError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the node manager controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Object store error
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Kubernetes API error outside of the object store client
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Object whose apiVersion matches no known machine API
    #[error("Unsupported machine kind: {0}")]
    UnsupportedMachineKind(String),

    /// Object with fields of the wrong shape
    #[error("Invalid object: {0}")]
    InvalidObject(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Leader election failed or the lease was lost
    #[error("Leader election failed: {0}")]
    LeaderElection(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics/health server failed
    #[error("Server error: {0}")]
    Server(String),
}

impl ControllerError {
    /// Optimistic-concurrency failure, requeued without noise.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Cluster(e) => e.is_conflict(),
            Self::Kube(KubeError::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    /// The object is gone.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Cluster(e) => e.is_not_found(),
            Self::Kube(KubeError::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Malformed input that retrying cannot fix.
    pub fn is_invalid_object(&self) -> bool {
        matches!(self, Self::InvalidObject(_) | Self::Cluster(ClusterError::InvalidObject(_)))
    }

    /// Label value for the reconcile error counter.
    pub fn kind(&self) -> &'static str {
        if self.is_conflict() {
            "conflict"
        } else if self.is_not_found() {
            "not_found"
        } else if self.is_invalid_object() {
            "invalid_object"
        } else if matches!(self, Self::UnsupportedMachineKind(_)) {
            "unsupported_machine_kind"
        } else {
            "api"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let conflict = ControllerError::from(ClusterError::Conflict("stale".to_string()));
        assert!(conflict.is_conflict());
        assert!(!conflict.is_not_found());

        let gone = ControllerError::from(ClusterError::NotFound("n1".to_string()));
        assert!(gone.is_not_found());

        assert!(ControllerError::InvalidObject("spec.replicas".to_string()).is_invalid_object());
        assert!(!ControllerError::Watch("closed".to_string()).is_conflict());
        assert_eq!(conflict.kind(), "conflict");
        assert_eq!(ControllerError::UnsupportedMachineKind("x/v1".to_string()).kind(), "unsupported_machine_kind");
    }
}
