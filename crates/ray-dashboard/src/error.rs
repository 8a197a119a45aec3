//! Dashboard client errors

use thiserror::Error;

/// Errors returned by the dashboard client
#[derive(Debug, Error)]
pub enum DashboardError {
    /// The request never produced a response (connect, timeout, TLS)
    #[error("{operation} request to {url} failed: {message}")]
    Transport {
        /// Client operation that failed
        operation: &'static str,
        /// Request URL
        url: String,
        /// Underlying error text
        message: String,
    },

    /// The dashboard answered with a non-2xx status
    #[error("{operation} fail: {status} {body}")]
    Status {
        /// Client operation that failed
        operation: &'static str,
        /// Status line (e.g. "500 Internal Server Error")
        status: String,
        /// Numeric status code
        code: u16,
        /// Response body, verbatim
        body: String,
    },

    /// A 2xx response body could not be decoded
    #[error("{operation} failed to decode response: {message}; body: {body}")]
    Decode {
        /// Client operation that failed
        operation: &'static str,
        /// Decoder error text
        message: String,
        /// Response body, verbatim
        body: String,
    },

    /// Input could not be mapped into a dashboard request
    #[error("invalid {field}: {message}")]
    InvalidConfig {
        /// Offending field (e.g. "deployments[0].userConfig")
        field: String,
        /// Description of the problem
        message: String,
    },

    /// Stop was refused and the job is still running
    #[error("failed to stop job {job_id}: status {status}")]
    JobNotStopped {
        /// Job that could not be stopped
        job_id: String,
        /// Status reported after the refused stop
        status: String,
    },

    /// The HTTP client could not be constructed
    #[error("failed to build dashboard HTTP client: {message}")]
    ClientBuild {
        /// Builder error text
        message: String,
    },
}

impl DashboardError {
    /// Create an invalid-config error for a field
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same call later might succeed
    ///
    /// Transport failures and non-2xx answers are transient; malformed input or
    /// output will fail the same way until something changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Status { .. })
    }
}

/// Result alias for dashboard operations
pub type Result<T> = std::result::Result<T, DashboardError>;
