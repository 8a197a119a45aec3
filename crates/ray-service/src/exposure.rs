//! Stable network objects owned by a RayService
//!
//! The head Service, serve Service and optional Ingress keep fixed names for
//! the life of the RayService. Their selectors are repointed at whichever
//! cluster is authoritative, which is how traffic moves during an upgrade.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use ray_common::crd::{RayCluster, RayService};
use ray_common::naming::{head_ingress_name, serve_service_name, service_head_service_name};
use ray_common::{
    DASHBOARD_PORT_NAME, RAY_CLUSTER_LABEL_KEY, RAY_NODE_TYPE_HEAD, RAY_NODE_TYPE_LABEL_KEY,
    RAY_SERVE_LABEL_KEY, RAY_SERVICE_LABEL_KEY, SERVE_PORT_NAME,
};

use crate::cluster_builder::owner_reference;

/// Annotation selecting the ingress controller
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Head ports used when the head container declares no named ports
pub const DEFAULT_HEAD_PORTS: [(&str, i32); 4] = [
    ("gcs", 6379),
    (DASHBOARD_PORT_NAME, 8265),
    ("client", 10001),
    (SERVE_PORT_NAME, 8000),
];

fn default_port(name: &str) -> Option<i32> {
    DEFAULT_HEAD_PORTS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, p)| *p)
}

fn metadata(service: &RayService, name: String) -> Result<ObjectMeta, ray_common::Error> {
    Ok(ObjectMeta {
        name: Some(name),
        namespace: service.namespace(),
        labels: Some(BTreeMap::from([(
            RAY_SERVICE_LABEL_KEY.to_string(),
            service.name_any(),
        )])),
        owner_references: Some(vec![owner_reference(service)?]),
        ..Default::default()
    })
}

/// Named ports of the cluster's head container, or the defaults
fn head_ports(cluster: &RayCluster) -> Vec<(String, i32)> {
    let declared: Vec<(String, i32)> = cluster
        .spec
        .head_container_ports()
        .into_iter()
        .filter_map(|p| p.name.map(|name| (name, p.container_port)))
        .collect();
    if declared.is_empty() {
        DEFAULT_HEAD_PORTS
            .iter()
            .map(|(n, p)| (n.to_string(), *p))
            .collect()
    } else {
        declared
    }
}

fn head_port(cluster: &RayCluster, name: &str) -> Option<i32> {
    head_ports(cluster)
        .into_iter()
        .find(|(n, _)| n == name)
        .map(|(_, p)| p)
        .or_else(|| default_port(name))
}

fn service_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        ..Default::default()
    }
}

/// `<service>-head-svc` pointing at the authoritative cluster's head pod
pub fn build_head_service(
    service: &RayService,
    cluster: &RayCluster,
) -> Result<Service, ray_common::Error> {
    let selector = BTreeMap::from([
        (RAY_CLUSTER_LABEL_KEY.to_string(), cluster.name_any()),
        (
            RAY_NODE_TYPE_LABEL_KEY.to_string(),
            RAY_NODE_TYPE_HEAD.to_string(),
        ),
    ]);
    let ports = head_ports(cluster)
        .iter()
        .map(|(name, port)| service_port(name, *port))
        .collect();

    Ok(Service {
        metadata: metadata(service, service_head_service_name(&service.name_any()))?,
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(ports),
            type_: cluster.spec.head_group_spec.service_type.clone(),
            ..Default::default()
        }),
        status: None,
    })
}

/// `<service>-serve-svc` selecting serve-capable pods of the authoritative cluster
pub fn build_serve_service(
    service: &RayService,
    cluster: &RayCluster,
) -> Result<Service, ray_common::Error> {
    let selector = BTreeMap::from([
        (RAY_CLUSTER_LABEL_KEY.to_string(), cluster.name_any()),
        (RAY_SERVE_LABEL_KEY.to_string(), "true".to_string()),
    ]);
    let port = head_port(cluster, SERVE_PORT_NAME).ok_or_else(|| {
        ray_common::Error::validation_for_field(
            cluster.name_any(),
            "headGroupSpec.template",
            "no serve port",
        )
    })?;

    Ok(Service {
        metadata: metadata(service, serve_service_name(&service.name_any()))?,
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![service_port(SERVE_PORT_NAME, port)]),
            ..Default::default()
        }),
        status: None,
    })
}

/// `<service>-head-ingress` routing `/` to the head Service's dashboard port
pub fn build_head_ingress(
    service: &RayService,
    cluster: &RayCluster,
) -> Result<Ingress, ray_common::Error> {
    let port = head_port(cluster, DASHBOARD_PORT_NAME).ok_or_else(|| {
        ray_common::Error::validation_for_field(
            cluster.name_any(),
            "headGroupSpec.template",
            "no dashboard port",
        )
    })?;

    let path = HTTPIngressPath {
        path: Some("/".to_string()),
        path_type: "Prefix".to_string(),
        backend: IngressBackend {
            service: Some(IngressServiceBackend {
                name: service_head_service_name(&service.name_any()),
                port: Some(ServiceBackendPort {
                    number: Some(port),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        },
    };

    Ok(Ingress {
        metadata: metadata(service, head_ingress_name(&service.name_any()))?,
        spec: Some(IngressSpec {
            ingress_class_name: service.annotations().get(INGRESS_CLASS_ANNOTATION).cloned(),
            rules: Some(vec![IngressRule {
                host: None,
                http: Some(HTTPIngressRuleValue { paths: vec![path] }),
            }]),
            ..Default::default()
        }),
        status: None,
    })
}
