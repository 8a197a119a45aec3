//! Client for the Ray dashboard's Serve and Jobs HTTP APIs
//!
//! The RayService controller uses this to push deployment graphs onto a
//! cluster and to poll application health; job control rides on the same
//! client.

pub mod client;
pub mod error;
pub mod types;

pub use client::{
    dashboard_address, DashboardClient, DashboardClientFactory, HttpDashboardClient,
    HttpDashboardClientFactory, REQUEST_TIMEOUT,
};
pub use error::{DashboardError, Result};
pub use types::{
    DeploymentStatusInfo, JobInfo, JobStatus, JobSubmission, ServeApplicationStatus,
    ServeDetails, DEFAULT_APPLICATION_NAME,
};
