//! RayService reconciliation controller
//!
//! Each tick observes the world and moves a RayService one step along:
//!
//! 1. delete RayClusters labeled for the service that are neither active nor pending
//! 2. pick a new pending cluster name when there is no active cluster or its
//!    template drifted from the spec
//! 3. create the pending cluster, or recreate it if its template drifted
//! 4. push the serve graph to the cluster under evaluation and fold its health
//! 5. promote a fully healthy pending cluster to active
//! 6. point the stable head/serve Services (and Ingress) at the authoritative cluster
//! 7. persist status and requeue
//!
//! No state is terminal; a restart only ever assigns a new pending name and
//! the active cluster keeps serving until its replacement is healthy.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Endpoints, ObjectReference, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use ray_common::crd::{
    set_condition, ClusterServeStatus, Condition, RayCluster, RayService, RayServiceStatus,
    ServiceStatus, CONDITION_SERVICE_READY, CONDITION_UPGRADE_IN_PROGRESS,
};
use ray_common::events::{actions, reasons, EventPublisher};
use ray_common::naming::{cluster_head_service_name, serve_service_name};
use ray_common::{
    KubeEventPublisher, DEFAULT_CLUSTER_DOMAIN, FIELD_MANAGER, RAY_SERVICE_LABEL_KEY,
};
#[cfg(test)]
use ray_common::NoopEventPublisher;
use ray_dashboard::{
    dashboard_address, DashboardClient, DashboardClientFactory, HttpDashboardClientFactory,
};

use crate::cluster_builder::{build_ray_cluster, generate_cluster_name};
use crate::config_cache::{config_key, config_key_prefix, ServeConfigCache};
use crate::exposure::{build_head_ingress, build_head_service, build_serve_service};
use crate::health::{
    all_deployments_healthy, update_dashboard_status, HealthEvaluator, HealthThresholds,
    PollingHealthEvaluator,
};
use crate::Error;

/// Requeue delay for steady state and after errors
pub const DEFAULT_REQUEUE: Duration = Duration::from_secs(2);

/// Requeue delay after a restart was marked
pub const RESTART_REQUEUE: Duration = Duration::from_secs(10);

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Kubernetes operations needed by the RayService controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RayServiceKubeClient: Send + Sync {
    /// Merge-patch the status of a RayService with a prepared patch body
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &serde_json::Value,
    ) -> Result<(), Error>;

    /// Get a RayCluster by name
    async fn get_ray_cluster(&self, name: &str, namespace: &str)
        -> Result<Option<RayCluster>, Error>;

    /// List RayClusters labeled as belonging to a RayService
    async fn list_ray_clusters(
        &self,
        namespace: &str,
        service_name: &str,
    ) -> Result<Vec<RayCluster>, Error>;

    /// Create a RayCluster; an existing one with the same name is success
    async fn create_ray_cluster(&self, namespace: &str, cluster: &RayCluster)
        -> Result<(), Error>;

    /// Delete a RayCluster with background propagation; a missing one is success
    async fn delete_ray_cluster(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Get a Service by name
    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error>;

    /// Create or update a Service by server-side apply
    async fn apply_service(&self, namespace: &str, service: &Service) -> Result<(), Error>;

    /// Create or update an Ingress by server-side apply
    async fn apply_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<(), Error>;

    /// Number of ready addresses behind a Service; zero when it has no Endpoints
    async fn count_endpoints(&self, name: &str, namespace: &str) -> Result<usize, Error>;
}

/// Real Kubernetes client implementation
pub struct RayServiceKubeClientImpl {
    client: Client,
}

impl RayServiceKubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RayServiceKubeClient for RayServiceKubeClientImpl {
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &serde_json::Value,
    ) -> Result<(), Error> {
        let api: Api<RayService> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = serde_json::json!({ "status": status });

        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;

        Ok(())
    }

    async fn get_ray_cluster(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<RayCluster>, Error> {
        let api: Api<RayCluster> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(cluster) => Ok(Some(cluster)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_ray_clusters(
        &self,
        namespace: &str,
        service_name: &str,
    ) -> Result<Vec<RayCluster>, Error> {
        let api: Api<RayCluster> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!("{RAY_SERVICE_LABEL_KEY}={service_name}");
        let params = ListParams::default().labels(&selector);
        Ok(api.list(&params).await?.items)
    }

    async fn create_ray_cluster(&self, namespace: &str, cluster: &RayCluster) -> Result<(), Error> {
        let api: Api<RayCluster> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), cluster).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(cluster = %cluster.name_any(), "RayCluster already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_ray_cluster(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<RayCluster> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(svc) => Ok(Some(svc)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_service(&self, namespace: &str, service: &Service) -> Result<(), Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            &service.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(service),
        )
        .await?;
        Ok(())
    }

    async fn apply_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<(), Error> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            &ingress.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(ingress),
        )
        .await?;
        Ok(())
    }

    async fn count_endpoints(&self, name: &str, namespace: &str) -> Result<usize, Error> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        let endpoints = match api.get(name).await {
            Ok(ep) => ep,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        Ok(endpoints
            .subsets
            .unwrap_or_default()
            .iter()
            .map(|subset| subset.addresses.as_ref().map_or(0, Vec::len))
            .sum())
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Process-wide tuning for the reconcile loop
#[derive(Clone, Debug, PartialEq)]
pub struct ReconcileSettings {
    /// Requeue delay for steady state and after errors
    pub default_requeue: Duration,
    /// Requeue delay after a restart was marked
    pub restart_requeue: Duration,
    /// Unhealthy thresholds unless a RayService overrides them
    pub thresholds: HealthThresholds,
    /// DNS domain used in dashboard addresses
    pub cluster_domain: String,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            default_requeue: DEFAULT_REQUEUE,
            restart_requeue: RESTART_REQUEUE,
            thresholds: HealthThresholds::default(),
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
        }
    }
}

impl ReconcileSettings {
    /// Thresholds for one service, applying its per-service overrides
    ///
    /// `serviceUnhealthySecondThreshold` bounds serve health and
    /// `deploymentUnhealthySecondThreshold` bounds dashboard reachability.
    /// Negative overrides are ignored.
    pub fn thresholds_for(&self, service: &RayService) -> HealthThresholds {
        let seconds = |v: Option<i32>| {
            v.filter(|s| *s >= 0)
                .map(|s| chrono::Duration::seconds(i64::from(s)))
        };
        HealthThresholds {
            service_unhealthy: seconds(service.spec.service_unhealthy_second_threshold)
                .unwrap_or(self.thresholds.service_unhealthy),
            dashboard_unhealthy: seconds(service.spec.deployment_unhealthy_second_threshold)
                .unwrap_or(self.thresholds.dashboard_unhealthy),
        }
    }
}

/// Shared state for every RayService reconcile
pub struct ServiceContext {
    /// Kubernetes client for API operations
    pub kube: Arc<dyn RayServiceKubeClient>,
    /// Builds a dashboard client for a cluster address
    pub dashboards: Arc<dyn DashboardClientFactory>,
    /// Serve health source
    pub health: Arc<dyn HealthEvaluator>,
    /// Last graph pushed to each cluster
    pub cache: Arc<ServeConfigCache>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Loop tuning
    pub settings: ReconcileSettings,
}

impl ServiceContext {
    /// Create a context from explicit dependencies
    pub fn new(
        kube: Arc<dyn RayServiceKubeClient>,
        dashboards: Arc<dyn DashboardClientFactory>,
        health: Arc<dyn HealthEvaluator>,
        cache: Arc<ServeConfigCache>,
        events: Arc<dyn EventPublisher>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            kube,
            dashboards,
            health,
            cache,
            events,
            settings,
        }
    }

    /// Create a production context from a Kubernetes client
    ///
    /// Polls serve health over HTTP and starts with an empty config cache.
    pub fn from_client(client: Client, settings: ReconcileSettings) -> Result<Self, Error> {
        let events = Arc::new(KubeEventPublisher::new(client.clone(), FIELD_MANAGER));
        Ok(Self {
            kube: Arc::new(RayServiceKubeClientImpl::new(client)),
            dashboards: Arc::new(HttpDashboardClientFactory::new()?),
            health: Arc::new(PollingHealthEvaluator),
            cache: Arc::new(ServeConfigCache::new()),
            events,
            settings,
        })
    }

    /// Create a context for testing with default settings and no events
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn RayServiceKubeClient>,
        dashboards: Arc<dyn DashboardClientFactory>,
    ) -> Self {
        Self {
            kube,
            dashboards,
            health: Arc::new(PollingHealthEvaluator),
            cache: Arc::new(ServeConfigCache::new()),
            events: Arc::new(NoopEventPublisher),
            settings: ReconcileSettings::default(),
        }
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile a RayService
#[instrument(skip(service, ctx), fields(service = %service.name_any()))]
pub async fn reconcile(
    service: Arc<RayService>,
    ctx: Arc<ServiceContext>,
) -> Result<Action, Error> {
    info!("reconciling RayService");
    let mut tick = ServiceTick::new(&service, &ctx)?;
    tick.run().await
}

/// Error policy for the RayService controller
///
/// Every failure is retried at the default delay; the next tick
/// re-evaluates from the world.
pub fn error_policy(service: Arc<RayService>, error: &Error, ctx: Arc<ServiceContext>) -> Action {
    error!(
        ?error,
        service = %service.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    Action::requeue(ctx.settings.default_requeue)
}

/// Which status slot a cluster is evaluated into
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Active,
    Pending,
}

impl Slot {
    fn of(self, status: &RayServiceStatus) -> &ClusterServeStatus {
        match self {
            Self::Active => &status.active_service_status,
            Self::Pending => &status.pending_service_status,
        }
    }

    fn of_mut(self, status: &mut RayServiceStatus) -> &mut ClusterServeStatus {
        match self {
            Self::Active => &mut status.active_service_status,
            Self::Pending => &mut status.pending_service_status,
        }
    }
}

/// Working state for one reconcile of one RayService
struct ServiceTick<'a> {
    service: &'a RayService,
    ctx: &'a ServiceContext,
    name: String,
    namespace: String,
    object_ref: ObjectReference,
    thresholds: HealthThresholds,
    /// Status being built; written back by `persist`
    status: RayServiceStatus,
    /// Cluster names that must not be reused for a new pending cluster
    names_in_use: BTreeSet<String>,
}

impl<'a> ServiceTick<'a> {
    fn new(service: &'a RayService, ctx: &'a ServiceContext) -> Result<Self, Error> {
        let name = service.name_any();
        let namespace = service.namespace().ok_or_else(|| {
            ray_common::Error::validation_for_field(
                &name,
                "metadata.namespace",
                "RayService must be namespaced",
            )
        })?;
        Ok(Self {
            service,
            ctx,
            name,
            namespace,
            object_ref: service.object_ref(&()),
            thresholds: ctx.settings.thresholds_for(service),
            status: service.status.clone().unwrap_or_default(),
            names_in_use: BTreeSet::new(),
        })
    }

    async fn run(&mut self) -> Result<Action, Error> {
        let (active, pending) = match self.reconcile_clusters().await {
            Ok(clusters) => clusters,
            Err(e) => {
                self.record(ServiceStatus::FailedToGetOrCreateRayCluster).await;
                return Err(e);
            }
        };

        self.sweep_config_cache();

        if self.status.pending_service_status.is_set() && pending.is_none() {
            debug!(
                pending = %self.status.pending_service_status.ray_cluster_name,
                "pending cluster not observed yet"
            );
            self.persist().await?;
            return Ok(Action::requeue(self.ctx.settings.default_requeue));
        }

        let healthy = match (&active, &pending) {
            (Some(active), None) => {
                self.status.pending_service_status = ClusterServeStatus::default();
                self.reconcile_serve(active, Slot::Active).await?
            }
            (Some(active), Some(pending)) => {
                if let Err(e) = self.refresh_active(active).await {
                    warn!(
                        cluster = %active.name_any(),
                        error = %e,
                        "failed to refresh active cluster status"
                    );
                }
                self.reconcile_serve(pending, Slot::Pending).await?
            }
            (None, Some(pending)) => {
                self.status.active_service_status = ClusterServeStatus::default();
                self.reconcile_serve(pending, Slot::Pending).await?
            }
            (None, None) => {
                self.status.active_service_status = ClusterServeStatus::default();
                self.status.pending_service_status = ClusterServeStatus::default();
                self.persist().await?;
                false
            }
        };

        if !healthy {
            return Ok(Action::requeue(self.ctx.settings.restart_requeue));
        }

        // Traffic follows the pending cluster as soon as it is serving
        match pending.as_ref().or(active.as_ref()) {
            Some(cluster) => self.expose(cluster).await,
            None => Ok(Action::requeue(self.ctx.settings.default_requeue)),
        }
    }

    // -------------------------------------------------------------------------
    // Cluster lifecycle
    // -------------------------------------------------------------------------

    async fn reconcile_clusters(
        &mut self,
    ) -> Result<(Option<RayCluster>, Option<RayCluster>), Error> {
        let listed = self
            .ctx
            .kube
            .list_ray_clusters(&self.namespace, &self.name)
            .await?;
        self.names_in_use = listed.iter().map(|c| c.name_any()).collect();
        self.collect_garbage(&listed).await?;

        let active = self
            .get_cluster(&self.status.active_service_status.ray_cluster_name)
            .await?;
        let pending = self
            .get_cluster(&self.status.pending_service_status.ray_cluster_name)
            .await?;

        if self.should_prepare_new_cluster(active.as_ref()) {
            self.mark_restart().await;
            return Ok((active, None));
        }

        let pending = self.create_pending_if_needed(pending).await?;
        Ok((active, pending))
    }

    async fn collect_garbage(&self, listed: &[RayCluster]) -> Result<(), Error> {
        let active = &self.status.active_service_status.ray_cluster_name;
        let pending = &self.status.pending_service_status.ray_cluster_name;
        for cluster in listed {
            let cluster_name = cluster.name_any();
            if &cluster_name == active || &cluster_name == pending {
                continue;
            }
            info!(cluster = %cluster_name, "deleting stale RayCluster");
            self.ctx
                .kube
                .delete_ray_cluster(&cluster_name, &self.namespace)
                .await?;
            self.publish(
                EventType::Normal,
                reasons::CLUSTER_DELETED,
                actions::DELETE,
                format!("Deleted stale RayCluster {cluster_name}"),
            )
            .await;
        }
        Ok(())
    }

    async fn get_cluster(&self, name: &str) -> Result<Option<RayCluster>, Error> {
        if name.is_empty() {
            return Ok(None);
        }
        self.ctx.kube.get_ray_cluster(name, &self.namespace).await
    }

    fn should_prepare_new_cluster(&self, active: Option<&RayCluster>) -> bool {
        if self.status.pending_service_status.is_set() {
            return false;
        }
        let desired = &self.service.spec.ray_cluster_config;
        active.is_none_or(|cluster| !cluster.spec.matches_template(desired))
    }

    async fn create_pending_if_needed(
        &mut self,
        existing: Option<RayCluster>,
    ) -> Result<Option<RayCluster>, Error> {
        if !self.status.pending_service_status.is_set() {
            return Ok(None);
        }
        let service = self.service;
        let cluster_name = self.status.pending_service_status.ray_cluster_name.clone();
        let desired = &service.spec.ray_cluster_config;

        match existing {
            Some(cluster) if cluster.spec.matches_template(desired) => Ok(Some(cluster)),
            Some(_) => {
                // Deletion is asynchronous; recreate on a later tick
                info!(cluster = %cluster_name, "pending cluster template changed, deleting");
                self.ctx
                    .kube
                    .delete_ray_cluster(&cluster_name, &self.namespace)
                    .await?;
                self.publish(
                    EventType::Normal,
                    reasons::CLUSTER_DELETED,
                    actions::DELETE,
                    format!("Deleted outdated pending RayCluster {cluster_name}"),
                )
                .await;
                Ok(None)
            }
            None => {
                let cluster = build_ray_cluster(service, &cluster_name)?;
                info!(cluster = %cluster_name, "creating pending RayCluster");
                self.ctx
                    .kube
                    .create_ray_cluster(&self.namespace, &cluster)
                    .await?;
                self.names_in_use.insert(cluster_name.clone());
                self.publish(
                    EventType::Normal,
                    reasons::CLUSTER_CREATED,
                    actions::CREATE,
                    format!("Created RayCluster {cluster_name}"),
                )
                .await;
                Ok(Some(cluster))
            }
        }
    }

    /// Assign a fresh pending cluster name
    async fn mark_restart(&mut self) {
        let mut in_use = self.names_in_use.clone();
        in_use.insert(self.status.active_service_status.ray_cluster_name.clone());
        in_use.insert(self.status.pending_service_status.ray_cluster_name.clone());
        let cluster_name = generate_cluster_name(&self.name, &in_use);

        info!(cluster = %cluster_name, "preparing new pending cluster");
        self.status.pending_service_status = ClusterServeStatus::for_cluster(&cluster_name);
        self.status.service_status = Some(ServiceStatus::Restarting);
        self.names_in_use.insert(cluster_name.clone());

        self.publish(
            EventType::Normal,
            reasons::UPGRADE_STARTED,
            actions::RECONCILE,
            format!("Preparing RayCluster {cluster_name}"),
        )
        .await;
    }

    fn sweep_config_cache(&self) {
        let active_key = config_key(
            &self.namespace,
            &self.name,
            &self.status.active_service_status.ray_cluster_name,
        );
        let pending_key = config_key(
            &self.namespace,
            &self.name,
            &self.status.pending_service_status.ray_cluster_name,
        );
        let prefix = config_key_prefix(&self.namespace, &self.name);
        let removed = self.ctx.cache.sweep(&active_key, &pending_key, &prefix);
        if removed > 0 {
            debug!(removed, "evicted superseded serve configs");
        }
    }

    // -------------------------------------------------------------------------
    // Serve
    // -------------------------------------------------------------------------

    async fn dashboard_client(
        &self,
        cluster: &RayCluster,
    ) -> Result<Arc<dyn DashboardClient>, Error> {
        let cluster_name = cluster.name_any();
        let head_name = cluster_head_service_name(&cluster_name);
        let head = self
            .ctx
            .kube
            .get_service(&head_name, &self.namespace)
            .await?
            .ok_or_else(|| {
                Error::dashboard_unavailable(
                    &cluster_name,
                    format!("head service {head_name} not found"),
                )
            })?;
        let address = dashboard_address(&head, &self.ctx.settings.cluster_domain)?;
        Ok(self.ctx.dashboards.client_for(&address)?)
    }

    /// Record a failed dashboard interaction; restarts once past the threshold
    async fn dashboard_failed(&mut self, slot: Slot) {
        let record = &mut slot.of_mut(&mut self.status).dashboard_status;
        if update_dashboard_status(record, false, Utc::now(), self.thresholds.dashboard_unhealthy) {
            return;
        }
        let cluster_name = slot.of(&self.status).ray_cluster_name.clone();
        warn!(cluster = %cluster_name, "dashboard unreachable past threshold, restarting");
        self.publish(
            EventType::Warning,
            reasons::DASHBOARD_UNHEALTHY,
            actions::RECONCILE,
            format!("Dashboard of RayCluster {cluster_name} unreachable"),
        )
        .await;
        self.mark_restart().await;
    }

    /// Push config if needed, then fold serve health for the cluster in `slot`
    ///
    /// Returns whether the cluster is healthy. Failures are recorded in the
    /// status before being returned.
    async fn reconcile_serve(&mut self, cluster: &RayCluster, slot: Slot) -> Result<bool, Error> {
        let (service, ctx) = (self.service, self.ctx);
        let cluster_name = cluster.name_any();
        slot.of_mut(&mut self.status).ray_cluster_status =
            cluster.status.clone().unwrap_or_default();

        let client = match self.dashboard_client(cluster).await {
            Ok(client) => client,
            Err(e) => {
                self.dashboard_failed(slot).await;
                self.record(ServiceStatus::WaitForDashboard).await;
                return Err(e);
            }
        };

        let key = config_key(&self.namespace, &self.name, &cluster_name);
        let desired = &service.spec.serve_config;
        let recorded = slot.of(&self.status).serve_deployment_statuses.len();
        let should_push = match ctx.cache.get(&key) {
            None => true,
            Some(cached) => cached != *desired || recorded != cached.serve_config_specs.len(),
        };

        if should_push {
            if let Err(e) = client.update_deployments(desired).await {
                warn!(cluster = %cluster_name, error = %e, "failed to push serve config");
                self.publish(
                    EventType::Warning,
                    reasons::FAILED_TO_UPDATE_SERVE_APPLICATIONS,
                    actions::DEPLOY,
                    format!("Failed to update serve applications on {cluster_name}: {e}"),
                )
                .await;
                self.dashboard_failed(slot).await;
                self.record(ServiceStatus::FailedServeDeploy).await;
                return Err(e.into());
            }
            ctx.cache.set(key, desired.clone());
            self.publish(
                EventType::Normal,
                reasons::UPDATED_SERVE_APPLICATIONS,
                actions::DEPLOY,
                format!("Updated serve applications on {cluster_name}"),
            )
            .await;
        }

        let evaluated = ctx
            .health
            .evaluate(
                client.as_ref(),
                slot.of_mut(&mut self.status),
                self.thresholds.service_unhealthy,
            )
            .await;
        let healthy = match evaluated {
            Ok(healthy) => healthy,
            Err(e) => {
                warn!(cluster = %cluster_name, error = %e, "failed to poll serve status");
                self.dashboard_failed(slot).await;
                self.record(ServiceStatus::FailedToGetServeDeploymentStatus).await;
                return Err(e.into());
            }
        };

        update_dashboard_status(
            &mut slot.of_mut(&mut self.status).dashboard_status,
            true,
            Utc::now(),
            self.thresholds.dashboard_unhealthy,
        );
        info!(cluster = %cluster_name, ?slot, healthy, "checked serve health");

        if !healthy {
            self.mark_restart().await;
            self.persist().await?;
            return Ok(false);
        }

        self.status.service_status = Some(ServiceStatus::Running);
        let configured = desired.serve_config_specs.len();
        if slot == Slot::Pending && all_deployments_healthy(slot.of(&self.status), configured) {
            info!(cluster = %cluster_name, "promoting pending cluster");
            self.status.promote_pending();
            self.publish(
                EventType::Normal,
                reasons::CLUSTER_PROMOTED,
                actions::PROMOTE,
                format!("RayCluster {cluster_name} is now active"),
            )
            .await;
        }
        Ok(true)
    }

    /// Refresh the active slot while a pending cluster is evaluated
    async fn refresh_active(&mut self, cluster: &RayCluster) -> Result<(), Error> {
        self.status.active_service_status.ray_cluster_status =
            cluster.status.clone().unwrap_or_default();
        let now = Utc::now();
        let threshold = self.thresholds.dashboard_unhealthy;

        let client = match self.dashboard_client(cluster).await {
            Ok(client) => client,
            Err(e) => {
                update_dashboard_status(
                    &mut self.status.active_service_status.dashboard_status,
                    false,
                    now,
                    threshold,
                );
                return Err(e);
            }
        };

        let ctx = self.ctx;
        let evaluated = ctx
            .health
            .evaluate(
                client.as_ref(),
                &mut self.status.active_service_status,
                self.thresholds.service_unhealthy,
            )
            .await;
        let reachable = evaluated.is_ok();
        update_dashboard_status(
            &mut self.status.active_service_status.dashboard_status,
            reachable,
            now,
            threshold,
        );
        let healthy = evaluated?;
        debug!(cluster = %cluster.name_any(), healthy, "refreshed active cluster");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Exposure and status
    // -------------------------------------------------------------------------

    async fn expose(&mut self, cluster: &RayCluster) -> Result<Action, Error> {
        if cluster.spec.ingress_enabled() {
            if let Err(e) = self.apply_ingress(cluster).await {
                self.record(ServiceStatus::FailedToUpdateIngress).await;
                return Err(e);
            }
        }
        if let Err(e) = self.apply_services(cluster).await {
            self.record(ServiceStatus::FailedToUpdateService).await;
            return Err(e);
        }

        let serve_svc = serve_service_name(&self.name);
        let endpoints = match self.ctx.kube.count_endpoints(&serve_svc, &self.namespace).await {
            Ok(n) => n,
            Err(e) => {
                warn!(service = %serve_svc, error = %e, "failed to count serve endpoints");
                0
            }
        };
        self.status.num_serve_endpoints = i32::try_from(endpoints).unwrap_or(i32::MAX);

        let condition = if endpoints > 0 {
            Condition::new(
                CONDITION_SERVICE_READY,
                true.into(),
                "EndpointsReady",
                format!("{endpoints} serve endpoints ready"),
            )
        } else {
            Condition::new(
                CONDITION_SERVICE_READY,
                false.into(),
                "NoEndpoints",
                "serve Service has no ready endpoints",
            )
        };
        set_condition(&mut self.status.conditions, condition);

        self.persist().await?;
        Ok(Action::requeue(self.ctx.settings.default_requeue))
    }

    async fn apply_ingress(&self, cluster: &RayCluster) -> Result<(), Error> {
        let ingress = build_head_ingress(self.service, cluster)?;
        self.ctx.kube.apply_ingress(&self.namespace, &ingress).await
    }

    async fn apply_services(&self, cluster: &RayCluster) -> Result<(), Error> {
        let head = build_head_service(self.service, cluster)?;
        self.ctx.kube.apply_service(&self.namespace, &head).await?;
        let serve = build_serve_service(self.service, cluster)?;
        self.ctx.kube.apply_service(&self.namespace, &serve).await?;
        debug!(cluster = %cluster.name_any(), "exposure objects point at cluster");
        Ok(())
    }

    /// Write the status back, stamping derived fields
    async fn persist(&mut self) -> Result<(), Error> {
        let upgrading = self.status.pending_service_status.is_set();
        let condition = if upgrading {
            Condition::new(
                CONDITION_UPGRADE_IN_PROGRESS,
                true.into(),
                "PendingCluster",
                format!(
                    "preparing RayCluster {}",
                    self.status.pending_service_status.ray_cluster_name
                ),
            )
        } else {
            Condition::new(
                CONDITION_UPGRADE_IN_PROGRESS,
                false.into(),
                "NoPendingCluster",
                "no upgrade in progress",
            )
        };
        set_condition(&mut self.status.conditions, condition);
        self.status.observed_generation = self.service.metadata.generation;

        let patch = self
            .status
            .merge_patch(self.service.status.as_ref())
            .map_err(|e| ray_common::Error::serialization_for_kind("RayService", e.to_string()))?;
        self.ctx
            .kube
            .patch_status(&self.name, &self.namespace, &patch)
            .await
    }

    /// Record a failure state; a failed write is only logged
    async fn record(&mut self, state: ServiceStatus) {
        self.status.service_status = Some(state);
        if let Err(e) = self.persist().await {
            warn!(status = %state, error = %e, "failed to record service status");
        }
    }

    async fn publish(&self, type_: EventType, reason: &str, action: &str, note: String) {
        self.ctx
            .events
            .publish(&self.object_ref, type_, reason, action, Some(note))
            .await;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use k8s_openapi::api::core::v1::{
        Container, PodSpec, PodTemplateSpec, ServicePort, ServiceSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use mockall::mock;
    use ray_common::crd::{
        find_condition, ConditionStatus, HeadGroupSpec, RayClusterSpec, RayClusterStatus,
        RayServiceSpec, ServeConfigSpec, ServeDeploymentGraphSpec, ServeDeploymentStatus,
        WorkerGroupSpec,
    };
    use ray_common::{RAY_API_VERSION, DASHBOARD_PORT_NAME};
    use ray_dashboard::{
        DashboardError, DeploymentStatusInfo, JobInfo, JobSubmission, ServeApplicationStatus,
        ServeDetails,
    };

    mock! {
        Dashboard {}

        #[async_trait]
        impl DashboardClient for Dashboard {
            async fn get_deployments(&self) -> ray_dashboard::Result<String>;
            async fn update_deployments(
                &self,
                graph: &ServeDeploymentGraphSpec,
            ) -> ray_dashboard::Result<()>;
            async fn get_single_application_status(
                &self,
            ) -> ray_dashboard::Result<ServeApplicationStatus>;
            async fn get_serve_details(&self) -> ray_dashboard::Result<ServeDetails>;
            async fn get_multi_application_status(
                &self,
            ) -> ray_dashboard::Result<BTreeMap<String, ServeApplicationStatus>>;
            async fn get_job_info(&self, job_id: &str) -> ray_dashboard::Result<Option<JobInfo>>;
            async fn submit_job(&self, job: &JobSubmission) -> ray_dashboard::Result<String>;
            async fn stop_job(&self, job_id: &str) -> ray_dashboard::Result<()>;
        }
    }

    /// Hands out the same client for every address
    struct StaticDashboards(Arc<dyn DashboardClient>);

    impl DashboardClientFactory for StaticDashboards {
        fn client_for(&self, _address: &str) -> ray_dashboard::Result<Arc<dyn DashboardClient>> {
            Ok(Arc::clone(&self.0))
        }
    }

    // =========================================================================
    // In-memory cluster
    // =========================================================================

    #[derive(Default)]
    struct World {
        clusters: BTreeMap<String, RayCluster>,
        services: BTreeMap<String, Service>,
        ingresses: BTreeMap<String, Ingress>,
        endpoints: BTreeMap<String, usize>,
        status: Option<RayServiceStatus>,
        created: Vec<String>,
        deleted: Vec<String>,
    }

    /// Kubernetes stand-in that also plays the RayCluster controller by
    /// creating each cluster's head Service
    struct FakeKube {
        world: Mutex<World>,
        head_services: bool,
    }

    impl FakeKube {
        fn new() -> Self {
            Self {
                world: Mutex::new(World::default()),
                head_services: true,
            }
        }

        fn without_head_services() -> Self {
            Self {
                head_services: false,
                ..Self::new()
            }
        }

        fn world(&self) -> std::sync::MutexGuard<'_, World> {
            self.world.lock().unwrap()
        }
    }

    /// RFC 7386 merge, as the API server applies a status merge patch
    fn apply_merge(target: &mut serde_json::Value, patch: &serde_json::Value) {
        let serde_json::Value::Object(fields) = patch else {
            *target = patch.clone();
            return;
        };
        if !target.is_object() {
            *target = serde_json::json!({});
        }
        let serde_json::Value::Object(current) = target else {
            return;
        };
        for (key, value) in fields {
            if value.is_null() {
                current.remove(key);
            } else {
                apply_merge(current.entry(key.clone()).or_insert(serde_json::Value::Null), value);
            }
        }
    }

    fn head_service_for(cluster: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(cluster_head_service_name(cluster)),
                namespace: Some("ml".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    name: Some(DASHBOARD_PORT_NAME.to_string()),
                    port: 8265,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[async_trait]
    impl RayServiceKubeClient for FakeKube {
        async fn patch_status(
            &self,
            _name: &str,
            _namespace: &str,
            status: &serde_json::Value,
        ) -> Result<(), Error> {
            let mut world = self.world();
            let previous = world.status.take().unwrap_or_default();
            let mut stored = serde_json::to_value(previous).unwrap();
            apply_merge(&mut stored, status);
            world.status = Some(serde_json::from_value(stored).unwrap());
            Ok(())
        }

        async fn get_ray_cluster(
            &self,
            name: &str,
            _namespace: &str,
        ) -> Result<Option<RayCluster>, Error> {
            Ok(self.world().clusters.get(name).cloned())
        }

        async fn list_ray_clusters(
            &self,
            _namespace: &str,
            service_name: &str,
        ) -> Result<Vec<RayCluster>, Error> {
            Ok(self
                .world()
                .clusters
                .values()
                .filter(|c| {
                    c.labels().get(RAY_SERVICE_LABEL_KEY).map(String::as_str) == Some(service_name)
                })
                .cloned()
                .collect())
        }

        async fn create_ray_cluster(
            &self,
            _namespace: &str,
            cluster: &RayCluster,
        ) -> Result<(), Error> {
            let name = cluster.name_any();
            let mut world = self.world();
            world.created.push(name.clone());
            if self.head_services {
                world
                    .services
                    .insert(cluster_head_service_name(&name), head_service_for(&name));
            }
            world.clusters.entry(name).or_insert_with(|| cluster.clone());
            Ok(())
        }

        async fn delete_ray_cluster(&self, name: &str, _namespace: &str) -> Result<(), Error> {
            let mut world = self.world();
            world.deleted.push(name.to_string());
            world.clusters.remove(name);
            Ok(())
        }

        async fn get_service(
            &self,
            name: &str,
            _namespace: &str,
        ) -> Result<Option<Service>, Error> {
            Ok(self.world().services.get(name).cloned())
        }

        async fn apply_service(&self, _namespace: &str, service: &Service) -> Result<(), Error> {
            self.world().services.insert(service.name_any(), service.clone());
            Ok(())
        }

        async fn apply_ingress(&self, _namespace: &str, ingress: &Ingress) -> Result<(), Error> {
            self.world().ingresses.insert(ingress.name_any(), ingress.clone());
            Ok(())
        }

        async fn count_endpoints(&self, name: &str, _namespace: &str) -> Result<usize, Error> {
            Ok(self.world().endpoints.get(name).copied().unwrap_or(0))
        }
    }

    // =========================================================================
    // Fixtures
    // =========================================================================

    fn cluster_spec(ray_version: &str) -> RayClusterSpec {
        let template = PodTemplateSpec {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "ray".to_string(),
                    image: Some(format!("rayproject/ray:{ray_version}")),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        RayClusterSpec {
            ray_version: Some(ray_version.to_string()),
            head_group_spec: HeadGroupSpec {
                template: template.clone(),
                ..Default::default()
            },
            worker_group_specs: vec![WorkerGroupSpec {
                group_name: "small".to_string(),
                replicas: Some(1),
                min_replicas: Some(1),
                max_replicas: Some(5),
                template,
                ..Default::default()
            }],
            enable_in_tree_autoscaling: Some(true),
        }
    }

    fn serve_graph() -> ServeDeploymentGraphSpec {
        ServeDeploymentGraphSpec {
            import_path: "fruit.deployment_graph".to_string(),
            serve_config_specs: vec![
                ServeConfigSpec {
                    name: "MangoStand".to_string(),
                    num_replicas: Some(1),
                    ..Default::default()
                },
                ServeConfigSpec {
                    name: "OrangeStand".to_string(),
                    num_replicas: Some(1),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    fn sample_service() -> RayService {
        let mut svc = RayService::new(
            "fruit",
            RayServiceSpec {
                serve_config: serve_graph(),
                ray_cluster_config: cluster_spec("2.9.0"),
                service_unhealthy_second_threshold: None,
                deployment_unhealthy_second_threshold: None,
            },
        );
        svc.metadata.namespace = Some("ml".to_string());
        svc.metadata.uid = Some("uid-fruit".to_string());
        svc.metadata.generation = Some(1);
        svc
    }

    fn app(status: &str, deployments: &[(&str, &str)]) -> ServeApplicationStatus {
        ServeApplicationStatus {
            name: "default".to_string(),
            status: status.to_string(),
            message: String::new(),
            deployments: deployments
                .iter()
                .map(|(name, s)| {
                    (
                        name.to_string(),
                        DeploymentStatusInfo {
                            status: s.to_string(),
                            message: String::new(),
                        },
                    )
                })
                .collect(),
        }
    }

    fn all_healthy() -> ServeApplicationStatus {
        app(
            "HEALTHY",
            &[("MangoStand", "HEALTHY"), ("OrangeStand", "HEALTHY")],
        )
    }

    /// Dashboard whose polled status can be changed between ticks
    fn scripted_dashboard(polled: Arc<Mutex<ServeApplicationStatus>>) -> MockDashboard {
        let mut dashboard = MockDashboard::new();
        dashboard.expect_update_deployments().returning(|_| Ok(()));
        dashboard
            .expect_get_single_application_status()
            .returning(move || Ok(polled.lock().unwrap().clone()));
        dashboard
    }

    struct Harness {
        kube: Arc<FakeKube>,
        polled: Arc<Mutex<ServeApplicationStatus>>,
        ctx: Arc<ServiceContext>,
        service: RayService,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_kube(FakeKube::new())
        }

        fn with_kube(kube: FakeKube) -> Self {
            let polled = Arc::new(Mutex::new(all_healthy()));
            let dashboard = scripted_dashboard(Arc::clone(&polled));
            Self::build(kube, polled, dashboard)
        }

        fn build(
            kube: FakeKube,
            polled: Arc<Mutex<ServeApplicationStatus>>,
            dashboard: MockDashboard,
        ) -> Self {
            let kube = Arc::new(kube);
            let ctx = Arc::new(ServiceContext::for_testing(
                kube.clone(),
                Arc::new(StaticDashboards(Arc::new(dashboard))),
            ));
            Self {
                kube,
                polled,
                ctx,
                service: sample_service(),
            }
        }

        /// One reconcile; the persisted status is fed back like a watch event
        async fn tick(&mut self) -> Result<Action, Error> {
            let result = reconcile(Arc::new(self.service.clone()), Arc::clone(&self.ctx)).await;
            self.service.status = self.kube.world().status.clone();
            result
        }

        /// Create the service and drive it until its first cluster is active
        async fn steady(&mut self) {
            self.tick().await.unwrap();
            self.tick().await.unwrap();
            assert!(self.status().active_service_status.is_set());
            assert!(!self.status().pending_service_status.is_set());
        }

        fn status(&self) -> RayServiceStatus {
            self.service.status.clone().unwrap_or_default()
        }

        fn active(&self) -> String {
            self.status().active_service_status.ray_cluster_name
        }

        fn pending(&self) -> String {
            self.status().pending_service_status.ray_cluster_name
        }

        fn set_polled(&self, status: ServeApplicationStatus) {
            *self.polled.lock().unwrap() = status;
        }
    }

    // =========================================================================
    // Reconciliation Story Tests
    // =========================================================================

    /// Story: A new RayService gets a pending cluster that is promoted once healthy
    #[tokio::test]
    async fn story_new_service_is_brought_up_and_exposed() {
        let mut h = Harness::new();

        // Tick 1: only a name is assigned; creation waits for the next tick
        let action = h.tick().await.unwrap();
        assert_eq!(action, Action::requeue(DEFAULT_REQUEUE));
        let pending = h.pending();
        assert!(pending.starts_with("fruit-raycluster-"));
        assert_eq!(h.status().service_status, Some(ServiceStatus::Restarting));
        assert!(h.kube.world().created.is_empty());
        let upgrading = find_condition(&h.status().conditions, CONDITION_UPGRADE_IN_PROGRESS)
            .cloned()
            .unwrap();
        assert_eq!(upgrading.status, ConditionStatus::True);

        // Tick 2: cluster created, serve pushed, healthy, promoted
        let action = h.tick().await.unwrap();
        assert_eq!(action, Action::requeue(DEFAULT_REQUEUE));
        {
            let world = h.kube.world();
            assert_eq!(world.created, vec![pending.clone()]);
            let cluster = &world.clusters[&pending];
            assert_eq!(cluster.labels()[RAY_SERVICE_LABEL_KEY], "fruit");
            assert_eq!(cluster.owner_references()[0].api_version, RAY_API_VERSION);
            assert!(world.services.contains_key("fruit-head-svc"));
            assert!(world.services.contains_key("fruit-serve-svc"));
            assert!(world.ingresses.is_empty());
        }
        assert_eq!(h.active(), pending);
        assert!(h.pending().is_empty());
        let status = h.status();
        assert_eq!(status.service_status, Some(ServiceStatus::Running));
        assert_eq!(status.observed_generation, Some(1));
        assert!(status.active_service_status.dashboard_status.is_healthy);
        assert_eq!(status.active_service_status.serve_deployment_statuses.len(), 2);
        let ready = find_condition(&status.conditions, CONDITION_SERVICE_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);

        // Tick 3: endpoints appear behind the serve Service
        h.kube.world().endpoints.insert("fruit-serve-svc".to_string(), 2);
        h.tick().await.unwrap();
        let status = h.status();
        assert_eq!(status.num_serve_endpoints, 2);
        let ready = find_condition(&status.conditions, CONDITION_SERVICE_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
        let upgrading = find_condition(&status.conditions, CONDITION_UPGRADE_IN_PROGRESS).unwrap();
        assert_eq!(upgrading.status, ConditionStatus::False);
    }

    /// Story: Reconciling an unchanged service creates and deletes nothing
    #[tokio::test]
    async fn story_unchanged_spec_is_idempotent() {
        let mut h = Harness::new();
        h.steady().await;
        let active = h.active();
        let created = h.kube.world().created.len();

        for _ in 0..3 {
            h.tick().await.unwrap();
        }

        assert_eq!(h.active(), active);
        assert!(h.pending().is_empty());
        assert_eq!(h.kube.world().created.len(), created);
        assert!(h.kube.world().deleted.is_empty());
    }

    /// Story: Autoscaler edits to worker replicas do not trigger an upgrade
    #[tokio::test]
    async fn story_worker_replica_change_does_not_upgrade() {
        let mut h = Harness::new();
        h.steady().await;
        let active = h.active();

        {
            let mut world = h.kube.world();
            let cluster = world.clusters.get_mut(&active).unwrap();
            cluster.spec.worker_group_specs[0].replicas = Some(4);
        }
        h.tick().await.unwrap();

        assert_eq!(h.active(), active);
        assert!(h.pending().is_empty());
        assert_eq!(h.status().service_status, Some(ServiceStatus::Running));
    }

    /// Story: A template change rolls to a new cluster with zero downtime
    #[tokio::test]
    async fn story_template_change_rolls_to_new_cluster() {
        let mut h = Harness::new();
        h.steady().await;
        let old = h.active();

        // New template: a pending name distinct from active, active untouched
        h.service.spec.ray_cluster_config = cluster_spec("2.10.0");
        h.tick().await.unwrap();
        let new = h.pending();
        assert!(!new.is_empty());
        assert_ne!(new, old);
        assert_eq!(h.active(), old);

        // Pending comes up but its deployments are still updating
        h.set_polled(app(
            "DEPLOYING",
            &[("MangoStand", "UPDATING"), ("OrangeStand", "HEALTHY")],
        ));
        h.tick().await.unwrap();
        assert!(h.kube.world().clusters.contains_key(&new));
        assert_eq!(h.active(), old);
        assert_eq!(h.pending(), new);
        assert!(h.ctx.cache.get(&config_key("ml", "fruit", &new)).is_some());
        assert!(h.ctx.cache.get(&config_key("ml", "fruit", &old)).is_some());

        // The RayCluster controller reports the new cluster ready
        let reported = RayClusterStatus {
            state: Some("ready".to_string()),
            reason: Some("head pod running".to_string()),
            endpoints: BTreeMap::from([("dashboard".to_string(), "8265".to_string())]),
            ..Default::default()
        };
        if let Some(cluster) = h.kube.world().clusters.get_mut(&new) {
            cluster.status = Some(reported.clone());
        }
        h.tick().await.unwrap();
        assert_eq!(h.pending(), new);
        assert_eq!(h.status().pending_service_status.ray_cluster_status, reported);

        // Healthy: promoted, and the stored pending slot is emptied
        h.set_polled(all_healthy());
        h.tick().await.unwrap();
        assert_eq!(h.active(), new);
        assert!(h.pending().is_empty());
        assert_eq!(h.status().active_service_status.ray_cluster_status, reported);
        assert_eq!(h.status().pending_service_status, ClusterServeStatus::default());

        // Next tick: superseded cluster and its cached config are gone
        h.tick().await.unwrap();
        assert!(h.kube.world().deleted.contains(&old));
        assert!(!h.kube.world().clusters.contains_key(&old));
        assert!(h.ctx.cache.get(&config_key("ml", "fruit", &old)).is_none());
        assert_eq!(h.ctx.cache.keys(), vec![config_key("ml", "fruit", &new)]);
    }

    /// Story: An upgrade completes even after the serving cluster's
    /// dashboard becomes unreachable
    #[tokio::test]
    async fn story_upgrade_promotes_past_unreachable_active_dashboard() {
        let mut h = Harness::new();
        h.steady().await;
        let old = h.active();

        h.service.spec.ray_cluster_config = cluster_spec("2.10.0");
        h.tick().await.unwrap();
        let new = h.pending();
        assert!(!new.is_empty());

        // The serving cluster loses its head Service mid-upgrade
        h.kube
            .world()
            .services
            .remove(&cluster_head_service_name(&old));

        // Pending still deploying: active is recorded unreachable but kept
        h.set_polled(app(
            "DEPLOYING",
            &[("MangoStand", "UPDATING"), ("OrangeStand", "HEALTHY")],
        ));
        h.tick().await.unwrap();
        assert_eq!(h.active(), old);
        assert_eq!(h.pending(), new);
        assert!(!h.status().active_service_status.dashboard_status.is_healthy);

        // Pending healthy: promoted regardless of the active cluster
        h.set_polled(all_healthy());
        h.tick().await.unwrap();
        assert_eq!(h.active(), new);
        assert!(h.pending().is_empty());
        assert!(h.status().active_service_status.dashboard_status.is_healthy);
        assert_eq!(h.status().service_status, Some(ServiceStatus::Running));
    }

    /// Story: Promotion happens once and sticks
    #[tokio::test]
    async fn story_promotion_is_monotonic() {
        let mut h = Harness::new();
        h.steady().await;
        let active = h.active();

        h.tick().await.unwrap();
        h.tick().await.unwrap();

        assert_eq!(h.active(), active);
        assert!(h.pending().is_empty());
    }

    /// Story: Deployments unhealthy past the threshold trigger a restart
    #[tokio::test]
    async fn story_sustained_unhealthy_deployment_restarts() {
        let mut h = Harness::new();
        h.steady().await;
        let active = h.active();

        // The deployment has been unhealthy for 61 seconds
        let mut status = h.status();
        status.active_service_status.serve_deployment_statuses[0] = ServeDeploymentStatus {
            name: "MangoStand".to_string(),
            status: "UNHEALTHY".to_string(),
            health_last_update_time: Some(Utc::now() - chrono::Duration::seconds(61)),
            ..Default::default()
        };
        h.service.status = Some(status);
        h.set_polled(app(
            "HEALTHY",
            &[("MangoStand", "UNHEALTHY"), ("OrangeStand", "HEALTHY")],
        ));

        let action = h.tick().await.unwrap();

        assert_eq!(action, Action::requeue(RESTART_REQUEUE));
        assert_eq!(h.active(), active);
        assert!(h.pending().starts_with("fruit-raycluster-"));
        assert_ne!(h.pending(), active);
        assert_eq!(h.status().service_status, Some(ServiceStatus::Restarting));
    }

    /// Story: A brief unhealthy poll does not restart anything
    #[tokio::test]
    async fn story_brief_unhealthy_poll_is_tolerated() {
        let mut h = Harness::new();
        h.steady().await;

        h.set_polled(app(
            "HEALTHY",
            &[("MangoStand", "UNHEALTHY"), ("OrangeStand", "HEALTHY")],
        ));
        let action = h.tick().await.unwrap();
        assert_eq!(action, Action::requeue(DEFAULT_REQUEUE));
        assert!(h.pending().is_empty());

        h.set_polled(all_healthy());
        h.tick().await.unwrap();
        assert!(h.pending().is_empty());
        assert_eq!(h.status().service_status, Some(ServiceStatus::Running));
    }

    /// Story: A cluster without a head Service waits for its dashboard
    #[tokio::test]
    async fn story_missing_head_service_waits_for_dashboard() {
        let mut h = Harness::with_kube(FakeKube::without_head_services());
        h.tick().await.unwrap();
        let pending = h.pending();

        let err = h.tick().await.unwrap_err();

        assert!(matches!(err, Error::DashboardUnavailable { .. }));
        let status = h.status();
        assert_eq!(status.service_status, Some(ServiceStatus::WaitForDashboard));
        assert_eq!(h.pending(), pending);
        assert!(!status.pending_service_status.dashboard_status.is_healthy);
        assert!(status
            .pending_service_status
            .dashboard_status
            .health_last_update_time
            .is_some());
    }

    /// Story: A dashboard unreachable past its threshold gets a replacement cluster
    #[tokio::test]
    async fn story_dashboard_unreachable_past_threshold_restarts() {
        let mut h = Harness::with_kube(FakeKube::without_head_services());
        h.tick().await.unwrap();
        h.tick().await.unwrap_err();
        let stuck = h.pending();

        let mut status = h.status();
        status.pending_service_status.dashboard_status.health_last_update_time =
            Some(Utc::now() - chrono::Duration::seconds(61));
        h.service.status = Some(status);

        h.tick().await.unwrap_err();

        assert_ne!(h.pending(), stuck);
        assert!(h.pending().starts_with("fruit-raycluster-"));

        // The abandoned pending cluster is collected on the next tick; its
        // replacement has no head Service either
        h.tick().await.unwrap_err();
        assert!(h.kube.world().deleted.contains(&stuck));
    }

    /// Story: A failed push leaves the cache untouched and is recorded
    #[tokio::test]
    async fn story_failed_push_is_recorded() {
        let mut dashboard = MockDashboard::new();
        dashboard.expect_update_deployments().returning(|_| {
            Err(DashboardError::Status {
                operation: "update deployments",
                status: "500 Internal Server Error".to_string(),
                code: 500,
                body: "boom".to_string(),
            })
        });
        dashboard.expect_get_single_application_status().never();
        let polled = Arc::new(Mutex::new(all_healthy()));
        let mut h = Harness::build(FakeKube::new(), polled, dashboard);

        h.tick().await.unwrap();
        let err = h.tick().await.unwrap_err();

        assert!(matches!(err, Error::Dashboard(_)));
        assert!(err.is_retryable());
        assert!(h.ctx.cache.is_empty());
        let status = h.status();
        assert_eq!(status.service_status, Some(ServiceStatus::FailedServeDeploy));
        assert!(!status.pending_service_status.dashboard_status.is_healthy);
    }

    /// Story: Serve status poll failures are recorded but the push is cached
    #[tokio::test]
    async fn story_failed_status_poll_is_recorded() {
        let mut dashboard = MockDashboard::new();
        dashboard.expect_update_deployments().times(1).returning(|_| Ok(()));
        dashboard
            .expect_get_single_application_status()
            .returning(|| {
                Err(DashboardError::Transport {
                    operation: "get application status",
                    url: "http://fruit-head-svc:8265".to_string(),
                    message: "connection refused".to_string(),
                })
            });
        let polled = Arc::new(Mutex::new(all_healthy()));
        let mut h = Harness::build(FakeKube::new(), polled, dashboard);

        h.tick().await.unwrap();
        h.tick().await.unwrap_err();

        assert_eq!(
            h.status().service_status,
            Some(ServiceStatus::FailedToGetServeDeploymentStatus)
        );
        assert_eq!(h.ctx.cache.len(), 1);
    }

    /// Story: Stray clusters labeled for the service are garbage collected
    #[tokio::test]
    async fn story_stray_clusters_are_deleted() {
        let mut h = Harness::new();
        h.steady().await;

        let stray = build_ray_cluster(&h.service, "fruit-raycluster-stray").unwrap();
        let mut foreign = build_ray_cluster(&h.service, "other-raycluster-xxxxx").unwrap();
        foreign
            .labels_mut()
            .insert(RAY_SERVICE_LABEL_KEY.to_string(), "other".to_string());
        {
            let mut world = h.kube.world();
            world.clusters.insert(stray.name_any(), stray);
            world.clusters.insert(foreign.name_any(), foreign);
        }

        h.tick().await.unwrap();

        let world = h.kube.world();
        assert_eq!(world.deleted, vec!["fruit-raycluster-stray".to_string()]);
        assert!(world.clusters.contains_key("other-raycluster-xxxxx"));
    }

    /// Story: A pending cluster whose template drifted is recreated
    #[tokio::test]
    async fn story_drifted_pending_cluster_is_recreated() {
        let mut h = Harness::new();
        h.tick().await.unwrap();
        let pending = h.pending();

        // Someone created the pending cluster with an old template
        let mut stale = build_ray_cluster(&h.service, &pending).unwrap();
        stale.spec = cluster_spec("2.8.0");
        h.kube.world().clusters.insert(pending.clone(), stale);

        let action = h.tick().await.unwrap();
        assert_eq!(action, Action::requeue(DEFAULT_REQUEUE));
        assert!(h.kube.world().deleted.contains(&pending));
        assert_eq!(h.pending(), pending);

        h.tick().await.unwrap();
        let world = h.kube.world();
        assert_eq!(world.clusters[&h.active()].spec, h.service.spec.ray_cluster_config);
    }

    /// Story: Ingress is only managed when the head group asks for it
    #[tokio::test]
    async fn story_ingress_follows_enable_flag() {
        let mut h = Harness::new();
        h.service.spec.ray_cluster_config.head_group_spec.enable_ingress = Some(true);
        h.steady().await;

        let world = h.kube.world();
        let ingress = &world.ingresses["fruit-head-ingress"];
        let backend = ingress.spec.as_ref().unwrap().rules.as_ref().unwrap()[0]
            .http
            .as_ref()
            .unwrap()
            .paths[0]
            .backend
            .service
            .as_ref()
            .unwrap()
            .name
            .clone();
        assert_eq!(backend, "fruit-head-svc");
    }

    /// Story: Exposure failures are recorded with their own state
    #[tokio::test]
    async fn story_service_apply_failure_is_recorded() {
        let mut h = Harness::new();
        h.steady().await;

        let mut mock = MockRayServiceKubeClient::new();
        let clusters = h.kube.world().clusters.clone();
        let head_services = h.kube.world().services.clone();
        let recorded = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&recorded);
        mock.expect_list_ray_clusters()
            .returning(move |_, _| Ok(clusters.values().cloned().collect()));
        let lookup = h.kube.world().clusters.clone();
        mock.expect_get_ray_cluster()
            .returning(move |name, _| Ok(lookup.get(name).cloned()));
        mock.expect_get_service()
            .returning(move |name, _| Ok(head_services.get(name).cloned()));
        mock.expect_apply_service().returning(|_, _| {
            Err(ray_common::Error::validation("admission webhook denied").into())
        });
        mock.expect_patch_status().returning(move |_, _, patch| {
            let status: RayServiceStatus = serde_json::from_value(patch.clone()).unwrap();
            *sink.lock().unwrap() = Some(status);
            Ok(())
        });

        let ctx = Arc::new(ServiceContext::new(
            Arc::new(mock),
            Arc::clone(&h.ctx.dashboards),
            Arc::new(PollingHealthEvaluator),
            Arc::clone(&h.ctx.cache),
            Arc::new(NoopEventPublisher),
            ReconcileSettings::default(),
        ));

        let err = reconcile(Arc::new(h.service.clone()), ctx).await.unwrap_err();

        assert!(err.to_string().contains("admission webhook denied"));
        let status = recorded.lock().unwrap().clone().unwrap();
        assert_eq!(status.service_status, Some(ServiceStatus::FailedToUpdateService));
    }

    /// Story: Listing failures surface as a cluster error
    #[tokio::test]
    async fn story_list_failure_is_recorded() {
        let mut mock = MockRayServiceKubeClient::new();
        mock.expect_list_ray_clusters()
            .returning(|_, _| {
                Err(ray_common::Error::internal_with_context("list", "etcd timeout").into())
            });
        mock.expect_patch_status()
            .withf(|_, _, patch| patch["serviceStatus"] == "FailedToGetOrCreateRayCluster")
            .times(1)
            .returning(|_, _, _| Ok(()));
        let ctx = Arc::new(ServiceContext::for_testing(
            Arc::new(mock),
            Arc::new(StaticDashboards(Arc::new(MockDashboard::new()))),
        ));

        assert!(reconcile(Arc::new(sample_service()), ctx).await.is_err());
    }

    // =========================================================================
    // Settings and error policy
    // =========================================================================

    #[test]
    fn per_service_thresholds_override_defaults() {
        let settings = ReconcileSettings::default();
        let mut svc = sample_service();
        assert_eq!(settings.thresholds_for(&svc), HealthThresholds::default());

        svc.spec.service_unhealthy_second_threshold = Some(300);
        svc.spec.deployment_unhealthy_second_threshold = Some(-5);
        let t = settings.thresholds_for(&svc);
        assert_eq!(t.service_unhealthy, chrono::Duration::seconds(300));
        assert_eq!(t.dashboard_unhealthy, chrono::Duration::seconds(60));
    }

    #[test]
    fn namespace_is_required() {
        let mut svc = sample_service();
        svc.metadata.namespace = None;
        let ctx = ServiceContext::for_testing(
            Arc::new(FakeKube::new()),
            Arc::new(StaticDashboards(Arc::new(MockDashboard::new()))),
        );
        assert!(ServiceTick::new(&svc, &ctx).is_err());
    }

    /// Story: Every failure is retried at the default delay
    #[test]
    fn story_error_policy_requeues() {
        let ctx = Arc::new(ServiceContext::for_testing(
            Arc::new(FakeKube::new()),
            Arc::new(StaticDashboards(Arc::new(MockDashboard::new()))),
        ));
        let svc = Arc::new(sample_service());

        let hard = Error::from(ray_common::Error::validation("bad spec"));
        assert_eq!(
            error_policy(Arc::clone(&svc), &hard, Arc::clone(&ctx)),
            Action::requeue(DEFAULT_REQUEUE)
        );

        let transient = Error::dashboard_unavailable("fruit-raycluster-abcde", "no head service");
        assert_eq!(error_policy(svc, &transient, ctx), Action::requeue(DEFAULT_REQUEUE));
    }
}
