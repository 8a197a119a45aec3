//! Serve and dashboard health evaluation
//!
//! A single bad poll never fails a cluster. Each record keeps a
//! `healthLastUpdateTime` that is reset to "now" while healthy and carried
//! forward while unhealthy, so only an unhealthy streak longer than the
//! threshold counts.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ray_common::crd::{
    AppStatus, ClusterServeStatus, DashboardStatus, ServeDeploymentStatus, HEALTHY_STATUS,
};
use ray_dashboard::{DashboardClient, DashboardError, ServeApplicationStatus};
use tracing::debug;

/// Default unhealthy threshold for both serve and dashboard health
pub const DEFAULT_UNHEALTHY_THRESHOLD_SECS: i64 = 60;

/// Thresholds in effect for one RayService
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthThresholds {
    /// How long the application or a deployment may stay non-healthy
    pub service_unhealthy: Duration,
    /// How long the dashboard may stay unreachable
    pub dashboard_unhealthy: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            service_unhealthy: Duration::seconds(DEFAULT_UNHEALTHY_THRESHOLD_SECS),
            dashboard_unhealthy: Duration::seconds(DEFAULT_UNHEALTHY_THRESHOLD_SECS),
        }
    }
}

fn within_threshold(since: Option<DateTime<Utc>>, now: DateTime<Utc>, threshold: Duration) -> bool {
    since.is_none_or(|t| now - t <= threshold)
}

/// Next `healthLastUpdateTime` for an entity
///
/// Healthy resets to `now`; an unhealthy entity whose previous record was
/// also unhealthy keeps the previous time.
fn next_health_time(
    polled: &str,
    previous: Option<(&str, Option<DateTime<Utc>>)>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if polled == HEALTHY_STATUS {
        return Some(now);
    }
    match previous {
        Some((status, since)) if status != HEALTHY_STATUS => since.or(Some(now)),
        _ => Some(now),
    }
}

/// Fold a polled application status into a slot's records
///
/// Returns whether every entity has been non-healthy for at most `threshold`.
pub fn fold_serve_status(
    slot: &mut ClusterServeStatus,
    polled: &ServeApplicationStatus,
    now: DateTime<Utc>,
    threshold: Duration,
) -> bool {
    let previous: BTreeMap<&str, &ServeDeploymentStatus> = slot
        .serve_deployment_statuses
        .iter()
        .map(|d| (d.name.as_str(), d))
        .collect();

    let mut healthy = true;
    let deployments: Vec<ServeDeploymentStatus> = polled
        .deployments
        .iter()
        .map(|(name, info)| {
            let prev = previous
                .get(name.as_str())
                .map(|p| (p.status.as_str(), p.health_last_update_time));
            let since = next_health_time(&info.status, prev, now);
            if !within_threshold(since, now, threshold) {
                debug!(
                    deployment = %name,
                    status = %info.status,
                    "deployment unhealthy past threshold"
                );
                healthy = false;
            }
            ServeDeploymentStatus {
                name: name.clone(),
                status: info.status.clone(),
                message: info.message.clone(),
                last_update_time: Some(now),
                health_last_update_time: since,
            }
        })
        .collect();

    let app_prev = Some((
        slot.app_status.status.as_str(),
        slot.app_status.health_last_update_time,
    ));
    let app_since = next_health_time(&polled.status, app_prev, now);
    if !within_threshold(app_since, now, threshold) {
        debug!(status = %polled.status, "application unhealthy past threshold");
        healthy = false;
    }

    slot.serve_deployment_statuses = deployments;
    slot.app_status = AppStatus {
        status: polled.status.clone(),
        message: polled.message.clone(),
        last_update_time: Some(now),
        health_last_update_time: app_since,
    };

    healthy
}

/// Whether the slot reports exactly the configured deployments, all HEALTHY
///
/// A short or long count means the dashboard has not caught up with the
/// configuration yet and is treated as not ready.
pub fn all_deployments_healthy(slot: &ClusterServeStatus, configured: usize) -> bool {
    slot.serve_deployment_statuses.len() == configured
        && slot
            .serve_deployment_statuses
            .iter()
            .all(|d| d.status == HEALTHY_STATUS)
}

/// Record a dashboard call outcome
///
/// Returns whether the dashboard has been reachable within `threshold`.
pub fn update_dashboard_status(
    status: &mut DashboardStatus,
    reachable: bool,
    now: DateTime<Utc>,
    threshold: Duration,
) -> bool {
    status.last_update_time = Some(now);
    status.is_healthy = reachable;
    if reachable || status.health_last_update_time.is_none() {
        status.health_last_update_time = Some(now);
    }
    within_threshold(status.health_last_update_time, now, threshold)
}

/// Source of serve health for a cluster
///
/// Polling the dashboard is the only implementation today; the trait keeps
/// the controller independent of how health is obtained.
#[async_trait]
pub trait HealthEvaluator: Send + Sync {
    /// Refresh the slot's serve records and return overall health
    async fn evaluate(
        &self,
        client: &dyn DashboardClient,
        slot: &mut ClusterServeStatus,
        threshold: Duration,
    ) -> Result<bool, DashboardError>;
}

/// Polls the single-application status endpoint
#[derive(Clone, Copy, Debug, Default)]
pub struct PollingHealthEvaluator;

#[async_trait]
impl HealthEvaluator for PollingHealthEvaluator {
    async fn evaluate(
        &self,
        client: &dyn DashboardClient,
        slot: &mut ClusterServeStatus,
        threshold: Duration,
    ) -> Result<bool, DashboardError> {
        let polled = client.get_single_application_status().await?;
        Ok(fold_serve_status(slot, &polled, Utc::now(), threshold))
    }
}
