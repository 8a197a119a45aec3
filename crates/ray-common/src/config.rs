//! Environment configuration
//!
//! Trait-based access to process environment so the settings that depend on
//! it can be unit tested without touching global state.

use crate::DEFAULT_CLUSTER_DOMAIN;

/// Environment variable overriding the cluster DNS domain
pub const CLUSTER_DOMAIN_ENV: &str = "CLUSTER_DOMAIN";

/// Trait for reading operator environment configuration
#[cfg_attr(test, mockall::automock)]
pub trait EnvConfig: Send + Sync {
    /// Raw value of the cluster domain variable, if set
    fn cluster_domain(&self) -> Option<String>;
}

/// Resolve the cluster domain used in in-cluster service DNS names
///
/// Falls back to `cluster.local` when unset or blank.
pub fn cluster_domain_name(config: &dyn EnvConfig) -> String {
    config
        .cluster_domain()
        .map(|d| d.trim().trim_matches('.').to_string())
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| DEFAULT_CLUSTER_DOMAIN.to_string())
}

/// Default implementation that reads from environment variables
#[derive(Clone, Default)]
pub struct OsEnvConfig;

impl EnvConfig for OsEnvConfig {
    fn cluster_domain(&self) -> Option<String> {
        std::env::var(CLUSTER_DOMAIN_ENV).ok()
    }
}
