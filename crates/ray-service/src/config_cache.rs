//! Cache of the last deployment graph pushed to each cluster
//!
//! The dashboard does not remember what it was last sent, so the controller
//! tracks it here to avoid re-pushing an unchanged graph every reconcile.
//! Keys are `namespace/service/cluster`; each service only ever touches keys
//! under its own `namespace/service/` prefix.

use dashmap::DashMap;
use ray_common::crd::ServeDeploymentGraphSpec;
use tracing::debug;

/// Prefix shared by every cache key of one service
pub fn config_key_prefix(namespace: &str, service: &str) -> String {
    format!("{namespace}/{service}/")
}

/// Cache key for one cluster of a service
pub fn config_key(namespace: &str, service: &str, cluster: &str) -> String {
    format!("{}{cluster}", config_key_prefix(namespace, service))
}

/// Concurrent map from cluster key to last-pushed graph
///
/// Sharded locking: reconciles of different services never contend.
#[derive(Debug, Default)]
pub struct ServeConfigCache {
    entries: DashMap<String, ServeDeploymentGraphSpec>,
}

impl ServeConfigCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph last pushed under `key`
    pub fn get(&self, key: &str) -> Option<ServeDeploymentGraphSpec> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Record a successful push
    pub fn set(&self, key: impl Into<String>, graph: ServeDeploymentGraphSpec) {
        self.entries.insert(key.into(), graph);
    }

    /// Forget a key
    pub fn remove(&self, key: &str) -> Option<ServeDeploymentGraphSpec> {
        self.entries.remove(key).map(|(_, graph)| graph)
    }

    /// Snapshot of all keys
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of cached graphs
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every key under `prefix` other than the active and pending keys
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self, active_key: &str, pending_key: &str, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| {
            let keep = !key.starts_with(prefix) || key == active_key || key == pending_key;
            if !keep {
                debug!(%key, active_key, pending_key, "evicting serve config");
            }
            keep
        });
        before.saturating_sub(self.entries.len())
    }
}
