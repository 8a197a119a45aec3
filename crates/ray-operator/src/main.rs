//! Ray Operator - keeps Ray Serve applications available across cluster upgrades

mod controller_runner;

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};

use ray_common::config::{cluster_domain_name, EnvConfig, OsEnvConfig};
use ray_common::crd::{RayCluster, RayService};
use ray_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use ray_common::FIELD_MANAGER;
use ray_service::{HealthThresholds, ReconcileSettings, ServiceContext};

use crate::controller_runner::build_service_controller;

/// Ray Operator - RayService controller for zero-downtime Ray Serve upgrades
#[derive(Parser, Debug)]
#[command(name = "ray-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Log line format: json or text
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    #[command(flatten)]
    controller: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    Controller,
}

/// Reconcile loop tuning
#[derive(Args, Debug, Clone)]
struct ControllerArgs {
    /// DNS domain of the cluster; defaults to $CLUSTER_DOMAIN or cluster.local
    #[arg(long)]
    cluster_domain: Option<String>,

    /// Seconds serve applications may stay unhealthy before a restart
    #[arg(long, default_value_t = 60)]
    service_unhealthy_threshold_secs: u32,

    /// Seconds a dashboard may stay unreachable before a restart
    #[arg(long, default_value_t = 60)]
    dashboard_unhealthy_threshold_secs: u32,

    /// Requeue delay in steady state
    #[arg(long, default_value_t = 2)]
    default_requeue_secs: u64,

    /// Requeue delay after a restart was marked
    #[arg(long, default_value_t = 10)]
    restart_requeue_secs: u64,
}

impl ControllerArgs {
    fn settings(&self, env: &dyn EnvConfig) -> ReconcileSettings {
        let cluster_domain = match &self.cluster_domain {
            Some(domain) => domain.trim().trim_matches('.').to_string(),
            None => cluster_domain_name(env),
        };
        ReconcileSettings {
            default_requeue: Duration::from_secs(self.default_requeue_secs),
            restart_requeue: Duration::from_secs(self.restart_requeue_secs),
            thresholds: HealthThresholds {
                service_unhealthy: chrono::Duration::seconds(i64::from(
                    self.service_unhealthy_threshold_secs,
                )),
                dashboard_unhealthy: chrono::Duration::seconds(i64::from(
                    self.dashboard_unhealthy_threshold_secs,
                )),
            },
            cluster_domain,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crd_manifests()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "ray-operator".to_string(),
        format: cli.log_format,
    })?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(&cli.controller).await,
    }
}

/// Multi-document YAML for every CRD the operator relies on
fn crd_manifests() -> anyhow::Result<String> {
    let mut out = String::new();
    for crd in [RayService::crd(), RayCluster::crd()] {
        let yaml = serde_yaml::to_string(&crd)
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        out.push_str("---\n");
        out.push_str(&yaml);
    }
    Ok(out)
}

/// Ensure the Ray CRDs are installed
///
/// Uses server-side apply so CRD versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in [RayService::crd(), RayCluster::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "Installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }

    tracing::info!("All Ray CRDs installed/updated");
    Ok(())
}

async fn run_controller(args: &ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    ensure_crds_installed(&client).await?;

    let settings = args.settings(&OsEnvConfig);
    tracing::info!(?settings, "Starting controllers");

    let ctx = Arc::new(ServiceContext::from_client(client.clone(), settings)?);
    build_service_controller(client, ctx).await;

    tracing::info!("Controllers stopped");
    Ok(())
}
