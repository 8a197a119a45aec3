//! Error types shared by the RayService operator crates
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the resource it concerns where one is known.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for shared operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A resource spec or metadata is missing something the controller needs
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the offending resource
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "metadata.uid")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "telemetry")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error naming the resource and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Kubernetes 4xx responses other than conflicts and throttling need the
    /// input to change; everything else is transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => is_retryable_kube_error(source),
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

/// Classify a raw kube-rs error
///
/// Conflicts (409) and throttling (429) are retried like transport failures.
pub fn is_retryable_kube_error(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(ae) => !(400..500).contains(&ae.code) || ae.code == 409 || ae.code == 429,
        _ => true,
    }
}
