//! RayCluster construction for a RayService
//!
//! Pure functions: the desired RayCluster object for a cluster name, and the
//! generation of fresh pending-cluster names.

use std::collections::BTreeSet;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;
use rand::Rng;
use ray_common::crd::{RayCluster, RayService};
use ray_common::naming::MAX_NAME_LENGTH;
use ray_common::{RAY_API_VERSION, RAY_SERVICE_LABEL_KEY};

const CLUSTER_NAME_INFIX: &str = "-raycluster-";
const CLUSTER_NAME_SUFFIX_LEN: usize = 5;
const CLUSTER_NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Longest suffix appended to a cluster name by derived objects (`-head-svc`)
const DERIVED_SUFFIX_LEN: usize = "-head-svc".len();

/// Controller owner reference pointing at the RayService
///
/// Fails when the service has not been persisted yet (no UID).
pub fn owner_reference(service: &RayService) -> Result<OwnerReference, ray_common::Error> {
    let name = service.name_any();
    let uid = service.metadata.uid.clone().ok_or_else(|| {
        ray_common::Error::validation_for_field(&name, "metadata.uid", "RayService has no UID")
    })?;
    Ok(OwnerReference {
        api_version: RAY_API_VERSION.to_string(),
        kind: "RayService".to_string(),
        name,
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Desired RayCluster for `cluster_name`
///
/// Copies the service's labels and annotations, adds the owning-service
/// label, and takes the cluster template verbatim.
pub fn build_ray_cluster(
    service: &RayService,
    cluster_name: &str,
) -> Result<RayCluster, ray_common::Error> {
    let namespace = service.namespace().ok_or_else(|| {
        ray_common::Error::validation_for_field(
            service.name_any(),
            "metadata.namespace",
            "RayService has no namespace",
        )
    })?;

    let mut labels = service.labels().clone();
    labels.insert(RAY_SERVICE_LABEL_KEY.to_string(), service.name_any());

    let annotations = service.annotations().clone();

    Ok(RayCluster {
        metadata: ObjectMeta {
            name: Some(cluster_name.to_string()),
            namespace: Some(namespace),
            labels: Some(labels),
            annotations: (!annotations.is_empty()).then_some(annotations),
            owner_references: Some(vec![owner_reference(service)?]),
            ..Default::default()
        },
        spec: service.spec.ray_cluster_config.clone(),
        status: None,
    })
}

/// Fresh `<service>-raycluster-<xxxxx>` name not present in `in_use`
pub fn generate_cluster_name(service_name: &str, in_use: &BTreeSet<String>) -> String {
    generate_cluster_name_with(&mut rand::thread_rng(), service_name, in_use)
}

/// [`generate_cluster_name`] with an explicit random source
pub fn generate_cluster_name_with<R: Rng>(
    rng: &mut R,
    service_name: &str,
    in_use: &BTreeSet<String>,
) -> String {
    // Leave room for the infix, the suffix and the longest derived-object suffix
    let max_prefix =
        MAX_NAME_LENGTH - DERIVED_SUFFIX_LEN - CLUSTER_NAME_INFIX.len() - CLUSTER_NAME_SUFFIX_LEN;
    let prefix: String = service_name.to_ascii_lowercase().chars().take(max_prefix).collect();
    let prefix = prefix.trim_end_matches('-');

    loop {
        let suffix: String = (0..CLUSTER_NAME_SUFFIX_LEN)
            .map(|_| {
                let idx = rng.gen_range(0..CLUSTER_NAME_ALPHABET.len());
                CLUSTER_NAME_ALPHABET[idx] as char
            })
            .collect();
        let candidate = format!("{prefix}{CLUSTER_NAME_INFIX}{suffix}");
        if !in_use.contains(&candidate) {
            return candidate;
        }
    }
}
