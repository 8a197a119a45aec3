//! Controller runner - builds the RayService controller future

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use ray_common::crd::{RayCluster, RayService};
use ray_common::RAY_SERVICE_LABEL_KEY;
use ray_service::{error_policy, reconcile, ServiceContext};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Coalesce bursts of owned-object events into one reconcile
const DEBOUNCE: Duration = Duration::from_secs(1);

/// Watch config for objects created on behalf of a RayService
fn owned_watcher_config() -> WatcherConfig {
    WatcherConfig::default()
        .labels(RAY_SERVICE_LABEL_KEY)
        .timeout(WATCH_TIMEOUT_SECS)
}

/// Build the RayService controller future
///
/// Watches RayServices cluster-wide and re-reconciles a service when a
/// RayCluster, Service or Ingress it owns changes.
pub fn build_service_controller(
    client: Client,
    ctx: Arc<ServiceContext>,
) -> impl Future<Output = ()> + Send {
    let services: Api<RayService> = Api::all(client.clone());
    let clusters: Api<RayCluster> = Api::all(client.clone());
    let k8s_services: Api<Service> = Api::all(client.clone());
    let ingresses: Api<Ingress> = Api::all(client);

    tracing::info!("- RayService controller");

    Controller::new(services, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .owns(clusters, owned_watcher_config())
        .owns(k8s_services, owned_watcher_config())
        .owns(ingresses, owned_watcher_config())
        .with_config(ControllerConfig::default().debounce(DEBOUNCE))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("RayService"))
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
