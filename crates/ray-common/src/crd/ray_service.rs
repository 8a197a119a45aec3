//! RayService CRD types
//!
//! A RayService pairs a RayCluster template with a Ray Serve deployment graph.
//! The controller keeps one active cluster serving traffic and, during an
//! upgrade, a pending cluster that is promoted once its deployments are healthy.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ray_cluster::{RayClusterSpec, RayClusterStatus};
use super::types::Condition;

/// Serve status string for a healthy application or deployment
pub const HEALTHY_STATUS: &str = "HEALTHY";

/// Condition type: the serve Service has at least one endpoint
pub const CONDITION_SERVICE_READY: &str = "ServiceReady";

/// Condition type: a pending cluster is being brought up
pub const CONDITION_UPGRADE_IN_PROGRESS: &str = "UpgradeInProgress";

// =============================================================================
// Serve deployment graph
// =============================================================================

/// Actor resource options for one deployment
///
/// `runtimeEnv` and `resources` are YAML documents passed through to Ray.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RayActorOptionSpec {
    /// Runtime environment as YAML
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_env: Option<String>,

    /// CPUs reserved per replica
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_cpus: Option<f64>,

    /// GPUs reserved per replica
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_gpus: Option<f64>,

    /// Heap memory in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,

    /// Object store memory in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_store_memory: Option<u64>,

    /// Custom resources as YAML
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<String>,

    /// Required accelerator type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerator_type: Option<String>,
}

/// Configuration of a single Serve deployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServeConfigSpec {
    /// Deployment name, unique within the graph
    pub name: String,

    /// Fixed replica count (ignored when autoscaling is configured)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_replicas: Option<i32>,

    /// HTTP route prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_prefix: Option<String>,

    /// Max in-flight queries per replica
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_queries: Option<i32>,

    /// User config as YAML, passed to `reconfigure`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_config: Option<String>,

    /// Autoscaling config as YAML
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaling_config: Option<String>,

    /// Seconds between checks for in-flight requests during shutdown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graceful_shutdown_wait_loop_s: Option<i32>,

    /// Seconds to wait for in-flight requests before force-killing a replica
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graceful_shutdown_timeout_s: Option<i32>,

    /// Seconds between replica health checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_period_s: Option<i32>,

    /// Seconds before a health check is considered failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_timeout_s: Option<i32>,

    /// Actor resource options
    #[serde(default)]
    pub ray_actor_options: RayActorOptionSpec,
}

/// The Serve application deployed onto every cluster of the service
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServeDeploymentGraphSpec {
    /// Python import path of the deployment graph
    pub import_path: String,

    /// Application runtime environment as YAML
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_env: Option<String>,

    /// Per-deployment overrides
    #[serde(default, rename = "deployments")]
    pub serve_config_specs: Vec<ServeConfigSpec>,

    /// HTTP port Serve listens on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

// =============================================================================
// CRD
// =============================================================================

/// Desired state of a RayService
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ray.io",
    version = "v1alpha1",
    kind = "RayService",
    plural = "rayservices",
    namespaced,
    status = "RayServiceStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.serviceStatus"}"#,
    printcolumn = r#"{"name":"Active","type":"string","jsonPath":".status.activeServiceStatus.rayClusterName"}"#,
    printcolumn = r#"{"name":"Pending","type":"string","jsonPath":".status.pendingServiceStatus.rayClusterName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RayServiceSpec {
    /// Serve application to deploy
    pub serve_config: ServeDeploymentGraphSpec,

    /// Template for every RayCluster the service creates
    pub ray_cluster_config: RayClusterSpec,

    /// Seconds a serve application may stay non-healthy before a restart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_unhealthy_second_threshold: Option<i32>,

    /// Seconds the dashboard may stay unreachable before a restart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_unhealthy_second_threshold: Option<i32>,
}

// =============================================================================
// Status
// =============================================================================

/// Overall state of a RayService
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Serving from a healthy cluster
    Running,
    /// A replacement cluster is being prepared
    #[default]
    Restarting,
    /// The cluster's dashboard is not reachable yet
    WaitForDashboard,
    /// Listing, creating or deleting RayClusters failed
    FailedToGetOrCreateRayCluster,
    /// Creating or updating the Ingress failed
    FailedToUpdateIngress,
    /// Creating or updating the head or serve Service failed
    FailedToUpdateService,
    /// Pushing the deployment graph to the dashboard failed
    FailedServeDeploy,
    /// Polling serve status from the dashboard failed
    FailedToGetServeDeploymentStatus,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::Restarting => write!(f, "Restarting"),
            Self::WaitForDashboard => write!(f, "WaitForDashboard"),
            Self::FailedToGetOrCreateRayCluster => write!(f, "FailedToGetOrCreateRayCluster"),
            Self::FailedToUpdateIngress => write!(f, "FailedToUpdateIngress"),
            Self::FailedToUpdateService => write!(f, "FailedToUpdateService"),
            Self::FailedServeDeploy => write!(f, "FailedServeDeploy"),
            Self::FailedToGetServeDeploymentStatus => {
                write!(f, "FailedToGetServeDeploymentStatus")
            }
        }
    }
}

/// Reachability record for a cluster's dashboard
///
/// Timestamps are serialized even when unset so a status merge patch clears
/// values left from a previous cluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStatus {
    /// Whether the last dashboard call succeeded
    #[serde(default)]
    pub is_healthy: bool,

    /// Time of the last dashboard call
    #[serde(default)]
    pub last_update_time: Option<DateTime<Utc>>,

    /// Last time the dashboard was reachable
    #[serde(default)]
    pub health_last_update_time: Option<DateTime<Utc>>,
}

/// Polled status of the Serve application
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    /// Serve application status (e.g. HEALTHY, DEPLOYING)
    #[serde(default)]
    pub status: String,

    /// Message reported with the status
    #[serde(default)]
    pub message: String,

    /// Time of the last poll
    #[serde(default)]
    pub last_update_time: Option<DateTime<Utc>>,

    /// Last time the application was HEALTHY, or when it first became unhealthy
    #[serde(default)]
    pub health_last_update_time: Option<DateTime<Utc>>,
}

/// Polled status of one Serve deployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServeDeploymentStatus {
    /// Deployment name
    pub name: String,

    /// Deployment status (e.g. HEALTHY, UPDATING, UNHEALTHY)
    #[serde(default)]
    pub status: String,

    /// Message reported with the status
    #[serde(default)]
    pub message: String,

    /// Time of the last poll
    #[serde(default)]
    pub last_update_time: Option<DateTime<Utc>>,

    /// Last time the deployment was HEALTHY, or when it first became unhealthy
    #[serde(default)]
    pub health_last_update_time: Option<DateTime<Utc>>,
}

/// Everything tracked for one cluster slot (active or pending)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServeStatus {
    /// Name of the RayCluster in this slot; empty when the slot is unused
    #[serde(default)]
    pub ray_cluster_name: String,

    /// Snapshot of the RayCluster's own status
    #[serde(default)]
    pub ray_cluster_status: RayClusterStatus,

    /// Dashboard reachability
    #[serde(default)]
    pub dashboard_status: DashboardStatus,

    /// Serve application status
    #[serde(default)]
    pub app_status: AppStatus,

    /// Per-deployment serve status
    #[serde(default)]
    pub serve_deployment_statuses: Vec<ServeDeploymentStatus>,
}

impl ClusterServeStatus {
    /// Fresh slot record naming a cluster
    pub fn for_cluster(name: impl Into<String>) -> Self {
        Self {
            ray_cluster_name: name.into(),
            ..Default::default()
        }
    }

    /// Whether the slot names a cluster
    pub fn is_set(&self) -> bool {
        !self.ray_cluster_name.is_empty()
    }
}

/// Observed state of a RayService
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RayServiceStatus {
    /// Cluster currently serving traffic
    #[serde(default)]
    pub active_service_status: ClusterServeStatus,

    /// Cluster being prepared to replace the active one
    #[serde(default)]
    pub pending_service_status: ClusterServeStatus,

    /// Overall state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_status: Option<ServiceStatus>,

    /// Conditions (ServiceReady, UpgradeInProgress)
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Ready endpoints behind the serve Service
    #[serde(default)]
    pub num_serve_endpoints: i32,

    /// Generation of the spec this status reflects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl RayServiceStatus {
    /// Replace the active slot with the pending one and clear pending
    pub fn promote_pending(&mut self) {
        self.active_service_status = std::mem::take(&mut self.pending_service_status);
    }

    /// JSON merge patch body that turns `previous` into this status
    ///
    /// Merge patches merge objects key by key, so endpoint names that only
    /// `previous` carries are sent as `null`.
    pub fn merge_patch(
        &self,
        previous: Option<&RayServiceStatus>,
    ) -> serde_json::Result<serde_json::Value> {
        let mut body = serde_json::to_value(self)?;
        let Some(previous) = previous else {
            return Ok(body);
        };

        let slots = [
            (
                "/activeServiceStatus/rayClusterStatus/endpoints",
                &previous.active_service_status,
                &self.active_service_status,
            ),
            (
                "/pendingServiceStatus/rayClusterStatus/endpoints",
                &previous.pending_service_status,
                &self.pending_service_status,
            ),
        ];
        for (pointer, before, after) in slots {
            let Some(endpoints) = body.pointer_mut(pointer).and_then(|v| v.as_object_mut()) else {
                continue;
            };
            for name in before.ray_cluster_status.endpoints.keys() {
                if !after.ray_cluster_status.endpoints.contains_key(name) {
                    endpoints.insert(name.clone(), serde_json::Value::Null);
                }
            }
        }
        Ok(body)
    }
}

// =============================================================================
// Tests
// =============================================================================
