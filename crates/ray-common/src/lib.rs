//! Common types for the RayService operator: CRDs, errors, events and utilities

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod events;
pub mod naming;
pub mod telemetry;

pub use error::Error;
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API version string used in owner references and manifests
pub const RAY_API_VERSION: &str = "ray.io/v1alpha1";

/// Label on a RayCluster naming the RayService that owns it
pub const RAY_SERVICE_LABEL_KEY: &str = "ray.io/service";

/// Label on Ray pods naming the RayCluster they belong to
pub const RAY_CLUSTER_LABEL_KEY: &str = "ray.io/cluster";

/// Label on Ray pods distinguishing head and worker nodes
pub const RAY_NODE_TYPE_LABEL_KEY: &str = "ray.io/node-type";

/// Value of [`RAY_NODE_TYPE_LABEL_KEY`] for the head pod
pub const RAY_NODE_TYPE_HEAD: &str = "head";

/// Label on Ray pods that are allowed to receive serve traffic
pub const RAY_SERVE_LABEL_KEY: &str = "ray.io/serve";

/// Name of the head service port that exposes the dashboard
pub const DASHBOARD_PORT_NAME: &str = "dashboard";

/// Name of the head service port that exposes Ray Serve
pub const SERVE_PORT_NAME: &str = "serve";

/// Default Kubernetes cluster domain for service DNS names
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "rayservice-controller";
