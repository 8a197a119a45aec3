//! Dashboard wire types and the mappings into them
//!
//! Serve configuration arrives from the RayService spec with several fields as
//! YAML strings; the dashboard wants them as JSON objects. The mapping is
//! fallible: a malformed document is reported against the field it came from
//! instead of being silently dropped.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use ray_common::crd::{RayActorOptionSpec, ServeConfigSpec, ServeDeploymentGraphSpec};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DashboardError, Result};

/// Application name used when the dashboard runs a single application
pub const DEFAULT_APPLICATION_NAME: &str = "default";

// =============================================================================
// Deployment push
// =============================================================================

/// Body of `PUT /api/serve/deployments/`
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ServeDeploymentGraphRequest {
    /// Python import path of the graph
    pub import_path: String,
    /// Application runtime environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_env: Option<Map<String, Value>>,
    /// Per-deployment overrides
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deployments: Vec<ServeDeploymentRequest>,
    /// HTTP port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

/// One deployment entry in a push
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ServeDeploymentRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_queries: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_config: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaling_config: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graceful_shutdown_wait_loop_s: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graceful_shutdown_timeout_s: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_period_s: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_timeout_s: Option<i32>,
    #[serde(default)]
    pub ray_actor_options: RayActorOptionsRequest,
}

/// Actor options in a push
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RayActorOptionsRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_env: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_cpus: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_gpus: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_store_memory: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerator_type: Option<String>,
}

/// Parse an optional YAML document that must be a mapping
///
/// Absent, blank and `null` documents map to `None`.
fn yaml_object(field: &str, source: Option<&str>) -> Result<Option<Map<String, Value>>> {
    let Some(text) = source.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let value: Value = serde_yaml::from_str(text)
        .map_err(|e| DashboardError::invalid_config(field, e.to_string()))?;
    match value {
        Value::Object(map) => Ok(Some(map)),
        Value::Null => Ok(None),
        other => Err(DashboardError::invalid_config(
            field,
            format!("expected a mapping, got {other}"),
        )),
    }
}

impl RayActorOptionsRequest {
    fn from_spec(spec: &RayActorOptionSpec, field: &str) -> Result<Self> {
        Ok(Self {
            runtime_env: yaml_object(
                &format!("{field}.runtimeEnv"),
                spec.runtime_env.as_deref(),
            )?,
            num_cpus: spec.num_cpus,
            num_gpus: spec.num_gpus,
            memory: spec.memory,
            object_store_memory: spec.object_store_memory,
            resources: yaml_object(&format!("{field}.resources"), spec.resources.as_deref())?,
            accelerator_type: spec.accelerator_type.clone(),
        })
    }
}

impl ServeDeploymentRequest {
    fn from_spec(spec: &ServeConfigSpec, index: usize) -> Result<Self> {
        let field = format!("deployments[{index}]");
        Ok(Self {
            name: spec.name.clone(),
            num_replicas: spec.num_replicas,
            route_prefix: spec.route_prefix.clone(),
            max_concurrent_queries: spec.max_concurrent_queries,
            user_config: yaml_object(&format!("{field}.userConfig"), spec.user_config.as_deref())?,
            autoscaling_config: yaml_object(
                &format!("{field}.autoscalingConfig"),
                spec.autoscaling_config.as_deref(),
            )?,
            graceful_shutdown_wait_loop_s: spec.graceful_shutdown_wait_loop_s,
            graceful_shutdown_timeout_s: spec.graceful_shutdown_timeout_s,
            health_check_period_s: spec.health_check_period_s,
            health_check_timeout_s: spec.health_check_timeout_s,
            ray_actor_options: RayActorOptionsRequest::from_spec(
                &spec.ray_actor_options,
                &format!("{field}.rayActorOptions"),
            )?,
        })
    }
}

impl TryFrom<&ServeDeploymentGraphSpec> for ServeDeploymentGraphRequest {
    type Error = DashboardError;

    fn try_from(spec: &ServeDeploymentGraphSpec) -> Result<Self> {
        if spec.import_path.trim().is_empty() {
            return Err(DashboardError::invalid_config(
                "importPath",
                "must not be empty",
            ));
        }
        let deployments = spec
            .serve_config_specs
            .iter()
            .enumerate()
            .map(|(i, d)| ServeDeploymentRequest::from_spec(d, i))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            import_path: spec.import_path.clone(),
            runtime_env: yaml_object("runtimeEnv", spec.runtime_env.as_deref())?,
            deployments,
            port: spec.port,
        })
    }
}

// =============================================================================
// Serve status
// =============================================================================

/// Status of one deployment inside an application
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DeploymentStatusInfo {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
}

/// Uniform per-application status record
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ServeApplicationStatus {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub deployments: BTreeMap<String, DeploymentStatusInfo>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct AppStatusWire {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct NamedDeploymentStatusWire {
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
}

/// Body of `GET /api/serve/deployments/status`
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SingleApplicationStatusResponse {
    app_status: AppStatusWire,
    #[serde(default)]
    deployment_statuses: Vec<NamedDeploymentStatusWire>,
}

impl From<SingleApplicationStatusResponse> for ServeApplicationStatus {
    fn from(resp: SingleApplicationStatusResponse) -> Self {
        Self {
            name: DEFAULT_APPLICATION_NAME.to_string(),
            status: resp.app_status.status,
            message: resp.app_status.message,
            deployments: resp
                .deployment_statuses
                .into_iter()
                .map(|d| {
                    (
                        d.name,
                        DeploymentStatusInfo {
                            status: d.status,
                            message: d.message,
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Deployment entry in serve details
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ServeDeploymentDetails {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
}

/// Application entry in serve details
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ServeApplicationDetails {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub route_prefix: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub last_deployed_time_s: Option<f64>,
    #[serde(default)]
    pub deployments: BTreeMap<String, ServeDeploymentDetails>,
}

/// Body of `GET /api/serve/applications/`
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ServeDetails {
    #[serde(default)]
    pub applications: BTreeMap<String, ServeApplicationDetails>,
}

impl ServeDetails {
    /// Per-application status records keyed by application name
    ///
    /// An application entry without its own `name` takes the map key.
    pub fn application_statuses(&self) -> BTreeMap<String, ServeApplicationStatus> {
        self.applications
            .iter()
            .map(|(key, app)| {
                let name = if app.name.is_empty() {
                    key.clone()
                } else {
                    app.name.clone()
                };
                let status = ServeApplicationStatus {
                    name,
                    status: app.status.clone(),
                    message: app.message.clone(),
                    deployments: app
                        .deployments
                        .iter()
                        .map(|(d, details)| {
                            (
                                d.clone(),
                                DeploymentStatusInfo {
                                    status: details.status.clone(),
                                    message: details.message.clone(),
                                },
                            )
                        })
                        .collect(),
                };
                (key.clone(), status)
            })
            .collect()
    }
}

// =============================================================================
// Jobs
// =============================================================================

/// Lifecycle status of a Ray job
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Stopped,
    Succeeded,
    Failed,
}

impl JobStatus {
    /// Whether the job can no longer change state
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Body of `GET /api/jobs/{id}`
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct JobInfo {
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub entrypoint: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub start_time: Option<i64>,
    #[serde(default)]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// A job to submit
///
/// `runtime_env_base64` holds base64-encoded JSON, as stored on job resources.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobSubmission {
    /// Shell command run on the head node
    pub entrypoint: String,
    /// Caller-chosen job id; the dashboard picks one when unset
    pub job_id: Option<String>,
    /// Base64-encoded JSON runtime environment
    pub runtime_env_base64: Option<String>,
    /// Free-form metadata attached to the job
    pub metadata: BTreeMap<String, String>,
}

/// Body of `POST /api/jobs/`
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct JobSubmitRequest {
    pub entrypoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_env: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl TryFrom<&JobSubmission> for JobSubmitRequest {
    type Error = DashboardError;

    fn try_from(job: &JobSubmission) -> Result<Self> {
        let runtime_env = match job.runtime_env_base64.as_deref().filter(|s| !s.is_empty()) {
            None => None,
            Some(encoded) => {
                let bytes = STANDARD.decode(encoded).map_err(|e| {
                    DashboardError::invalid_config("runtimeEnv", format!("invalid base64: {e}"))
                })?;
                let value: Value = serde_json::from_slice(&bytes).map_err(|e| {
                    DashboardError::invalid_config("runtimeEnv", format!("invalid JSON: {e}"))
                })?;
                match value {
                    Value::Object(map) => Some(map),
                    _ => {
                        return Err(DashboardError::invalid_config(
                            "runtimeEnv",
                            "expected a JSON object",
                        ))
                    }
                }
            }
        };

        Ok(Self {
            entrypoint: job.entrypoint.clone(),
            job_id: job.job_id.clone(),
            runtime_env,
            metadata: job.metadata.clone(),
        })
    }
}

/// Body returned by `POST /api/jobs/`
#[derive(Clone, Debug, Deserialize)]
pub struct JobSubmitResponse {
    pub job_id: String,
}

/// Body returned by `POST /api/jobs/{id}/stop`
#[derive(Clone, Debug, Deserialize)]
pub struct JobStopResponse {
    pub stopped: bool,
}
