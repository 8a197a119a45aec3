//! HTTP client for the Ray dashboard
//!
//! One client is bound to one cluster's dashboard address. Every call checks
//! the status code before touching the body: a non-2xx answer becomes
//! [`DashboardError::Status`] with the body verbatim, and a 2xx body that does
//! not decode becomes [`DashboardError::Decode`], also with the body.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use ray_common::crd::ServeDeploymentGraphSpec;
use ray_common::DASHBOARD_PORT_NAME;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{DashboardError, Result};
use crate::types::{
    JobInfo, JobStopResponse, JobSubmission, JobSubmitRequest, JobSubmitResponse,
    ServeApplicationStatus, ServeDeploymentGraphRequest, ServeDetails,
    SingleApplicationStatusResponse,
};

/// Timeout applied to every dashboard request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

const DEPLOY_PATH: &str = "/api/serve/deployments/";
const STATUS_PATH: &str = "/api/serve/deployments/status";
const SERVE_DETAILS_PATH: &str = "/api/serve/applications/";
const JOB_PATH: &str = "/api/jobs/";

/// Operations against one cluster's dashboard
#[async_trait]
pub trait DashboardClient: Send + Sync {
    /// Raw body of the current serve deployments
    async fn get_deployments(&self) -> Result<String>;

    /// Push a deployment graph
    async fn update_deployments(&self, graph: &ServeDeploymentGraphSpec) -> Result<()>;

    /// Status of the single application, named `default`
    async fn get_single_application_status(&self) -> Result<ServeApplicationStatus>;

    /// Details of every live application
    async fn get_serve_details(&self) -> Result<ServeDetails>;

    /// Status of every live application, keyed by name
    async fn get_multi_application_status(
        &self,
    ) -> Result<BTreeMap<String, ServeApplicationStatus>>;

    /// Job info, or `None` if the dashboard does not know the job
    async fn get_job_info(&self, job_id: &str) -> Result<Option<JobInfo>>;

    /// Submit a job and return its id
    async fn submit_job(&self, job: &JobSubmission) -> Result<String>;

    /// Stop a job
    ///
    /// A refused stop is only an error while the job is still running.
    async fn stop_job(&self, job_id: &str) -> Result<()>;
}

/// Creates clients bound to a dashboard address
///
/// The controller asks for a fresh client per reconcile so no client is
/// shared between clusters.
pub trait DashboardClientFactory: Send + Sync {
    /// Client for the dashboard at `address` (`host:port`, optionally with scheme)
    fn client_for(&self, address: &str) -> Result<Arc<dyn DashboardClient>>;
}

/// Address of the dashboard behind a cluster's head Service
///
/// Uses the port named `dashboard`; a head Service without one is an error.
pub fn dashboard_address(service: &Service, cluster_domain: &str) -> Result<String> {
    let name = service.metadata.name.as_deref().unwrap_or_default();
    let namespace = service.metadata.namespace.as_deref().unwrap_or_default();
    let port = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| {
            ports
                .iter()
                .find(|p| p.name.as_deref() == Some(DASHBOARD_PORT_NAME))
        })
        .map(|p| p.port)
        .ok_or_else(|| {
            DashboardError::invalid_config(
                format!("service {namespace}/{name}"),
                "dashboard port not found",
            )
        })?;

    let address = format!("{name}.{namespace}.svc.{cluster_domain}:{port}");
    debug!(%address, "resolved dashboard address");
    Ok(address)
}

fn base_url(address: &str) -> String {
    let trimmed = address.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// reqwest-backed [`DashboardClient`]
#[derive(Clone)]
pub struct HttpDashboardClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDashboardClient {
    /// Client for `address` with the standard request timeout
    pub fn new(address: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DashboardError::ClientBuild {
                message: e.to_string(),
            })?;
        Ok(Self::with_client(client, address))
    }

    /// Client for `address` reusing an existing connection pool
    pub fn with_client(client: reqwest::Client, address: &str) -> Self {
        Self {
            client,
            base_url: base_url(address),
        }
    }

    /// Base URL requests are issued against
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<(StatusCode, String)> {
        let response = request
            .send()
            .await
            .map_err(|e| DashboardError::Transport {
                operation,
                url: url.to_string(),
                message: e.to_string(),
            })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DashboardError::Transport {
                operation,
                url: url.to_string(),
                message: format!("reading body: {e}"),
            })?;
        Ok((status, body))
    }

    /// Send and require a 2xx answer, returning the body
    async fn send_ok(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<String> {
        let (status, body) = self.send(operation, request, url).await?;
        ensure_success(operation, status, body)
    }
}

fn ensure_success(operation: &'static str, status: StatusCode, body: String) -> Result<String> {
    if !status.is_success() {
        return Err(DashboardError::Status {
            operation,
            status: status.to_string(),
            code: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

fn decode<T: DeserializeOwned>(operation: &'static str, body: String) -> Result<T> {
    serde_json::from_str(&body).map_err(|e| DashboardError::Decode {
        operation,
        message: e.to_string(),
        body,
    })
}

#[async_trait]
impl DashboardClient for HttpDashboardClient {
    async fn get_deployments(&self) -> Result<String> {
        let url = self.url(DEPLOY_PATH);
        self.send_ok("GetDeployments", self.client.get(&url), &url)
            .await
    }

    async fn update_deployments(&self, graph: &ServeDeploymentGraphSpec) -> Result<()> {
        let request = ServeDeploymentGraphRequest::try_from(graph)?;
        let url = self.url(DEPLOY_PATH);
        debug!(%url, deployments = request.deployments.len(), "pushing serve deployment graph");
        self.send_ok("UpdateDeployments", self.client.put(&url).json(&request), &url)
            .await?;
        Ok(())
    }

    async fn get_single_application_status(&self) -> Result<ServeApplicationStatus> {
        let url = self.url(STATUS_PATH);
        let body = self
            .send_ok("GetDeploymentsStatus", self.client.get(&url), &url)
            .await?;
        let resp: SingleApplicationStatusResponse = decode("GetDeploymentsStatus", body)?;
        Ok(resp.into())
    }

    async fn get_serve_details(&self) -> Result<ServeDetails> {
        let url = self.url(SERVE_DETAILS_PATH);
        let body = self
            .send_ok("GetServeDetails", self.client.get(&url), &url)
            .await?;
        decode("GetServeDetails", body)
    }

    async fn get_multi_application_status(
        &self,
    ) -> Result<BTreeMap<String, ServeApplicationStatus>> {
        Ok(self.get_serve_details().await?.application_statuses())
    }

    async fn get_job_info(&self, job_id: &str) -> Result<Option<JobInfo>> {
        let url = self.url(&format!("{JOB_PATH}{job_id}"));
        let (status, body) = self
            .send("GetJobInfo", self.client.get(&url), &url)
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = ensure_success("GetJobInfo", status, body)?;
        decode("GetJobInfo", body).map(Some)
    }

    async fn submit_job(&self, job: &JobSubmission) -> Result<String> {
        let request = JobSubmitRequest::try_from(job)?;
        let url = self.url(JOB_PATH);
        info!(entrypoint = %request.entrypoint, job_id = ?request.job_id, "submitting ray job");
        let body = self
            .send_ok("SubmitJob", self.client.post(&url).json(&request), &url)
            .await?;
        let resp: JobSubmitResponse = decode("SubmitJob", body)?;
        Ok(resp.job_id)
    }

    async fn stop_job(&self, job_id: &str) -> Result<()> {
        let url = self.url(&format!("{JOB_PATH}{job_id}/stop"));
        info!(job_id, "stopping ray job");
        let body = self
            .send_ok("StopJob", self.client.post(&url), &url)
            .await?;
        let resp: JobStopResponse = decode("StopJob", body)?;
        if resp.stopped {
            return Ok(());
        }

        match self.get_job_info(job_id).await? {
            Some(JobInfo {
                status: Some(status),
                ..
            }) if status.is_terminal() => Ok(()),
            Some(info) => Err(DashboardError::JobNotStopped {
                job_id: job_id.to_string(),
                status: info
                    .status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "UNKNOWN".to_string()),
            }),
            None => Err(DashboardError::JobNotStopped {
                job_id: job_id.to_string(),
                status: "NOT_FOUND".to_string(),
            }),
        }
    }
}

/// Factory producing [`HttpDashboardClient`]s that share one connection pool
#[derive(Clone)]
pub struct HttpDashboardClientFactory {
    client: reqwest::Client,
}

impl HttpDashboardClientFactory {
    /// Factory with the standard request timeout
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DashboardError::ClientBuild {
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

impl DashboardClientFactory for HttpDashboardClientFactory {
    fn client_for(&self, address: &str) -> Result<Arc<dyn DashboardClient>> {
        Ok(Arc::new(HttpDashboardClient::with_client(
            self.client.clone(),
            address,
        )))
    }
}
