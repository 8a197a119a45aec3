//! RayService reconciliation for the Ray operator
//!
//! Keeps a Ray Serve application available while its cluster template changes:
//!
//! - **Cluster builder**: desired RayCluster objects and fresh cluster names
//! - **Config cache**: last serve graph pushed to each cluster
//! - **Health**: hysteresis over serve and dashboard health
//! - **Exposure**: stable head/serve Services and the head Ingress
//! - **Controller**: the per-tick state machine that ties them together

pub mod cluster_builder;
pub mod config_cache;
pub mod controller;
pub mod error;
pub mod exposure;
pub mod health;

pub use config_cache::ServeConfigCache;
pub use controller::{
    error_policy, reconcile, ReconcileSettings, RayServiceKubeClient, RayServiceKubeClientImpl,
    ServiceContext, DEFAULT_REQUEUE, RESTART_REQUEUE,
};
pub use error::Error;
pub use health::{HealthEvaluator, HealthThresholds, PollingHealthEvaluator};
