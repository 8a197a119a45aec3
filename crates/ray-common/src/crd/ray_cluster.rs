//! RayCluster CRD types
//!
//! A RayCluster is one physical Ray cluster: a head pod plus worker groups.
//! The RayService controller creates and deletes these but never edits them;
//! pods and the per-cluster head Service are managed by the RayCluster
//! controller.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerPort, PodTemplateSpec};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Head / worker groups
// =============================================================================

/// Head node configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeadGroupSpec {
    /// Kubernetes Service type for the head service (ClusterIP, NodePort, LoadBalancer)
    #[serde(default)]
    pub service_type: Option<String>,

    /// Expose the head node's dashboard through an Ingress
    #[serde(default)]
    pub enable_ingress: Option<bool>,

    /// Arguments passed to `ray start` on the head node
    #[serde(default)]
    pub ray_start_params: BTreeMap<String, String>,

    /// Pod template for the head node
    pub template: PodTemplateSpec,
}

/// Pods the autoscaler has chosen to remove
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleStrategy {
    /// Worker pod names to delete on the next scale-down
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workers_to_delete: Vec<String>,
}

/// One homogeneous group of worker nodes
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerGroupSpec {
    /// Logical name of the group
    pub group_name: String,

    /// Desired worker count; owned by the autoscaler once running
    #[serde(default)]
    pub replicas: Option<i32>,

    /// Lower autoscaling bound
    #[serde(default)]
    pub min_replicas: Option<i32>,

    /// Upper autoscaling bound
    #[serde(default)]
    pub max_replicas: Option<i32>,

    /// Arguments passed to `ray start` on each worker
    #[serde(default)]
    pub ray_start_params: BTreeMap<String, String>,

    /// Pod template for workers in this group
    pub template: PodTemplateSpec,

    /// Autoscaler scale-down requests
    #[serde(default)]
    pub scale_strategy: Option<ScaleStrategy>,
}

// =============================================================================
// CRD
// =============================================================================

/// Desired state of a Ray cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ray.io",
    version = "v1alpha1",
    kind = "RayCluster",
    plural = "rayclusters",
    namespaced,
    status = "RayClusterStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Desired Workers","type":"integer","jsonPath":".status.desiredWorkerReplicas"}"#,
    printcolumn = r#"{"name":"Available Workers","type":"integer","jsonPath":".status.availableWorkerReplicas"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RayClusterSpec {
    /// Ray version running in the images
    #[serde(default)]
    pub ray_version: Option<String>,

    /// Head node configuration
    pub head_group_spec: HeadGroupSpec,

    /// Worker groups
    #[serde(default)]
    pub worker_group_specs: Vec<WorkerGroupSpec>,

    /// Run the Ray autoscaler as a head-pod sidecar
    #[serde(default)]
    pub enable_in_tree_autoscaling: Option<bool>,
}

impl RayClusterSpec {
    /// Copy of the spec with autoscaler-owned fields cleared
    ///
    /// Worker `replicas` and `scaleStrategy` are written by the autoscaler on
    /// live clusters; they must not count as a template change.
    pub fn without_autoscaler_fields(&self) -> Self {
        let mut spec = self.clone();
        for group in &mut spec.worker_group_specs {
            group.replicas = None;
            group.scale_strategy = None;
        }
        spec
    }

    /// Structural equality ignoring autoscaler-owned fields
    pub fn matches_template(&self, other: &Self) -> bool {
        self.without_autoscaler_fields() == other.without_autoscaler_fields()
    }

    /// Named container ports of the head pod's first container
    pub fn head_container_ports(&self) -> Vec<ContainerPort> {
        self.head_group_spec
            .template
            .spec
            .as_ref()
            .and_then(|pod| pod.containers.first())
            .and_then(|c| c.ports.clone())
            .unwrap_or_default()
    }

    /// Whether the head group asked for an Ingress
    pub fn ingress_enabled(&self) -> bool {
        self.head_group_spec.enable_ingress.unwrap_or(false)
    }
}

// =============================================================================
// Status
// =============================================================================

/// Network identity of the head node
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeadInfo {
    /// Head pod IP
    #[serde(default)]
    pub pod_ip: Option<String>,

    /// Head service cluster IP
    #[serde(default)]
    pub service_ip: Option<String>,
}

/// Observed state of a Ray cluster, written by the RayCluster controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RayClusterStatus {
    /// Coarse cluster state (ready, unhealthy, failed)
    #[serde(default)]
    pub state: Option<String>,

    /// Workers currently running and ready
    #[serde(default)]
    pub available_worker_replicas: i32,

    /// Workers requested across all groups
    #[serde(default)]
    pub desired_worker_replicas: i32,

    /// Sum of group minimums
    #[serde(default)]
    pub min_worker_replicas: i32,

    /// Sum of group maximums
    #[serde(default)]
    pub max_worker_replicas: i32,

    /// Service endpoints keyed by port name
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,

    /// Head node addresses
    #[serde(default)]
    pub head: HeadInfo,

    /// Last time the status was written
    #[serde(default)]
    pub last_update_time: Option<DateTime<Utc>>,

    /// Reason for the current state, if degraded
    #[serde(default)]
    pub reason: Option<String>,
}

// =============================================================================
// Tests
// =============================================================================
