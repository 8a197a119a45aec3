//! Derived object names
//!
//! Every object the operators create is named from its owner's name plus a
//! fixed suffix. Names are clamped to a valid DNS-1035 label so long service
//! names still yield creatable Services and Ingresses.

/// Maximum length of a DNS-1035 label
pub const MAX_NAME_LENGTH: usize = 63;

const HEAD_SERVICE_SUFFIX: &str = "head-svc";
const SERVE_SERVICE_SUFFIX: &str = "serve-svc";
const HEAD_INGRESS_SUFFIX: &str = "head-ingress";

/// Clamp a name to a valid DNS-1035 label
///
/// Over-long names keep their tail, which holds the distinguishing suffix.
/// A leading digit or dash gets an `r` prefix.
pub fn check_name(name: &str) -> String {
    let mut name = name.to_ascii_lowercase();
    if name.len() > MAX_NAME_LENGTH {
        let offset = name.len() - MAX_NAME_LENGTH;
        name = name[offset..].to_string();
    }
    if name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_digit() || c == '-')
    {
        name.replace_range(0..1, "r");
    }
    name
}

/// Name of the head Service the RayCluster controller creates for a cluster
pub fn cluster_head_service_name(cluster_name: &str) -> String {
    check_name(&format!("{cluster_name}-{HEAD_SERVICE_SUFFIX}"))
}

/// Name of the RayService-owned head Service
pub fn service_head_service_name(service_name: &str) -> String {
    check_name(&format!("{service_name}-{HEAD_SERVICE_SUFFIX}"))
}

/// Name of the RayService-owned serve Service
pub fn serve_service_name(service_name: &str) -> String {
    check_name(&format!("{service_name}-{SERVE_SERVICE_SUFFIX}"))
}

/// Name of the RayService-owned Ingress
pub fn head_ingress_name(service_name: &str) -> String {
    check_name(&format!("{service_name}-{HEAD_INGRESS_SUFFIX}"))
}
