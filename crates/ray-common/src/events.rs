//! Kubernetes Event recording for the RayService controller.
//!
//! Wraps `kube::runtime::events::Recorder` behind a trait so reconcilers can
//! emit Events visible via `kubectl describe rayservice` and tests can swap in
//! a no-op publisher.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate errors.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "ClusterPromoted")
    /// * `action` - What action was taken (e.g. "Promote")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as the given controller name.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// A pending RayCluster was created for the service
    pub const CLUSTER_CREATED: &str = "ClusterCreated";
    /// A stale or superseded RayCluster was deleted
    pub const CLUSTER_DELETED: &str = "ClusterDeleted";
    /// The pending RayCluster became the active one
    pub const CLUSTER_PROMOTED: &str = "ClusterPromoted";
    /// A new pending cluster name was assigned
    pub const UPGRADE_STARTED: &str = "UpgradeStarted";
    /// Serve applications were pushed to a cluster's dashboard
    pub const UPDATED_SERVE_APPLICATIONS: &str = "UpdatedServeApplications";
    /// Pushing serve applications failed
    pub const FAILED_TO_UPDATE_SERVE_APPLICATIONS: &str = "FailedToUpdateServeApplications";
    /// The dashboard stayed unreachable past its threshold
    pub const DASHBOARD_UNHEALTHY: &str = "DashboardUnhealthy";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Creating a child resource
    pub const CREATE: &str = "Create";
    /// Deleting a child resource
    pub const DELETE: &str = "Delete";
    /// Swapping the pending cluster into the active slot
    pub const PROMOTE: &str = "Promote";
    /// Pushing a deployment graph
    pub const DEPLOY: &str = "Deploy";
}
