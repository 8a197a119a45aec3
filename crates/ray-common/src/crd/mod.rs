//! Custom Resource Definitions for the Ray operator
//!
//! `RayService` is reconciled by this operator; `RayCluster` is created and
//! deleted by it and reconciled elsewhere.

mod ray_cluster;
mod ray_service;
mod types;

pub use ray_cluster::{
    HeadGroupSpec, HeadInfo, RayCluster, RayClusterSpec, RayClusterStatus, ScaleStrategy,
    WorkerGroupSpec,
};
pub use ray_service::{
    AppStatus, ClusterServeStatus, DashboardStatus, RayActorOptionSpec, RayService,
    RayServiceSpec, RayServiceStatus, ServeConfigSpec, ServeDeploymentGraphSpec,
    ServeDeploymentStatus, ServiceStatus, CONDITION_SERVICE_READY, CONDITION_UPGRADE_IN_PROGRESS,
    HEALTHY_STATUS,
};
pub use types::{find_condition, set_condition, Condition, ConditionStatus};
