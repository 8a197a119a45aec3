//! RayService controller errors

use ray_dashboard::DashboardError;
use thiserror::Error;

/// Errors surfaced by a RayService reconcile
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes, validation or serialization failure
    #[error(transparent)]
    Common(#[from] ray_common::Error),

    /// A dashboard call failed
    #[error("dashboard error: {0}")]
    Dashboard(#[from] DashboardError),

    /// No dashboard address could be derived for a cluster
    #[error("dashboard unavailable for cluster {cluster}: {message}")]
    DashboardUnavailable {
        /// RayCluster whose dashboard is unreachable
        cluster: String,
        /// Why no address was found
        message: String,
    },
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Self::Common(err.into())
    }
}

impl Error {
    /// Create a dashboard-unavailable error
    pub fn dashboard_unavailable(cluster: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DashboardUnavailable {
            cluster: cluster.into(),
            message: message.into(),
        }
    }

    /// Whether a later reconcile might succeed without a spec change
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Common(e) => e.is_retryable(),
            Self::Dashboard(e) => e.is_retryable(),
            Self::DashboardUnavailable { .. } => true,
        }
    }
}
