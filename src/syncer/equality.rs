//! Pure spec/metadata/data equality between tenant and super objects.
//!
//! Each check returns the updated object (or part) when a write is needed
//! and `None` when the two views already agree, so callers can patch
//! without diffing twice. Fields that are intentionally divergent — a pod's
//! `nodeName`, a service's `clusterIP` — belong to the super side and are
//! never treated as drift.

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{PodSpec, Secret, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

use crate::config::ProjectionConfig;
use crate::syncer::conversion::PREFIX;

pub const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";

fn matches_prefix(key: &str, prefixes: &[String]) -> bool {
    prefixes
        .iter()
        .any(|p| key == p || key.starts_with(&format!("{p}/")) || key.starts_with(&format!("{p}.")))
}

/// Downward spec equality for pods. The tenant owns the mutable pod fields
/// (images, activeDeadlineSeconds, tolerations it may add); scheduling
/// results stay with the super cluster.
pub fn check_pod_spec_equality(p: &PodSpec, v: &PodSpec) -> Option<PodSpec> {
    let mut updated = p.clone();
    let mut changed = false;

    if p.active_deadline_seconds != v.active_deadline_seconds {
        updated.active_deadline_seconds = v.active_deadline_seconds;
        changed = true;
    }

    for vc in &v.containers {
        if let Some(pc) = updated
            .containers
            .iter_mut()
            .find(|pc| pc.name == vc.name)
        {
            if pc.image != vc.image {
                pc.image = vc.image.clone();
                changed = true;
            }
        }
    }

    if changed { Some(updated) } else { None }
}

/// Downward spec equality for services: the tenant view is authoritative
/// modulo the addresses the super cluster allocated.
pub fn check_service_spec_equality(p: &ServiceSpec, v: &ServiceSpec) -> Option<ServiceSpec> {
    let mut desired = v.clone();
    desired.cluster_ip = p.cluster_ip.clone();
    desired.cluster_ips = p.cluster_ips.clone();
    desired.health_check_node_port = p.health_check_node_port.clone();

    if &desired != p { Some(desired) } else { None }
}

/// Secret payload reconciliation. Returns `(updated, equal)`; when not
/// equal the first element is the payload the destination should hold.
pub fn check_binary_data_equality(
    p_data: Option<&BTreeMap<String, ByteString>>,
    v_data: Option<&BTreeMap<String, ByteString>>,
) -> (Option<BTreeMap<String, ByteString>>, bool) {
    let empty = BTreeMap::new();
    let p = p_data.unwrap_or(&empty);
    let v = v_data.unwrap_or(&empty);
    if p == v {
        (None, true)
    } else {
        (Some(v.clone()), false)
    }
}

pub fn is_service_account_token(secret: &Secret) -> bool {
    secret.type_.as_deref() == Some(SERVICE_ACCOUNT_TOKEN_TYPE)
}

/// Secret equality with the SA-token special case: the super copy's data
/// holds a token minted in the super cluster and is authoritative there, so
/// tenant-side edits to it are ignored.
pub fn check_secret_equality(p: &Secret, v: &Secret) -> Option<Secret> {
    if is_service_account_token(v) {
        return None;
    }
    let (updated, equal) = check_binary_data_equality(p.data.as_ref(), v.data.as_ref());
    let string_changed = p.string_data != v.string_data;
    if equal && !string_changed {
        return None;
    }
    let mut desired = p.clone();
    if let Some(updated) = updated {
        desired.data = Some(updated);
    }
    desired.string_data = v.string_data.clone();
    Some(desired)
}

/// Upward metadata flow: only keys under a transparent prefix move from the
/// super object into the tenant view; opaque prefixes never cross.
pub fn check_uw_meta_equality(
    cfg: &ProjectionConfig,
    p_meta: &ObjectMeta,
    v_meta: &ObjectMeta,
) -> Option<ObjectMeta> {
    let mut updated = v_meta.clone();
    let mut changed = false;

    let empty = BTreeMap::new();

    let p_ann = p_meta.annotations.as_ref().unwrap_or(&empty);
    let mut v_ann = v_meta.annotations.clone().unwrap_or_default();
    for (k, val) in p_ann {
        if !matches_prefix(k, &cfg.transparent_meta_prefixes) {
            continue;
        }
        if matches_prefix(k, &cfg.opaque_meta_prefixes) || k.starts_with(PREFIX) {
            continue;
        }
        if v_ann.get(k) != Some(val) {
            v_ann.insert(k.clone(), val.clone());
            changed = true;
        }
    }

    let p_labels = p_meta.labels.as_ref().unwrap_or(&empty);
    let mut v_labels = v_meta.labels.clone().unwrap_or_default();
    for (k, val) in p_labels {
        if !matches_prefix(k, &cfg.transparent_meta_prefixes) {
            continue;
        }
        if matches_prefix(k, &cfg.opaque_meta_prefixes) || k.starts_with(PREFIX) {
            continue;
        }
        if v_labels.get(k) != Some(val) {
            v_labels.insert(k.clone(), val.clone());
            changed = true;
        }
    }

    if !changed {
        return None;
    }
    updated.annotations = Some(v_ann);
    updated.labels = Some(v_labels);
    Some(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Container;

    fn cfg() -> ProjectionConfig {
        ProjectionConfig::default()
    }

    fn pod_spec(image: &str, node: Option<&str>) -> PodSpec {
        PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                image: Some(image.to_string()),
                ..Default::default()
            }],
            node_name: node.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn pod_image_drift_is_reported_but_node_name_is_not() {
        let p = pod_spec("busybox:1.36", Some("node-1"));
        let v = pod_spec("busybox:1.37", None);
        let updated = check_pod_spec_equality(&p, &v).unwrap();
        assert_eq!(
            updated.containers[0].image.as_deref(),
            Some("busybox:1.37")
        );
        // nodeName stays super-authoritative.
        assert_eq!(updated.node_name.as_deref(), Some("node-1"));

        let same = pod_spec("busybox:1.36", Some("node-1"));
        assert!(check_pod_spec_equality(&same, &pod_spec("busybox:1.36", None)).is_none());
    }

    #[test]
    fn service_cluster_ip_is_super_authoritative() {
        let mut p = ServiceSpec {
            cluster_ip: Some("10.0.0.7".to_string()),
            ..Default::default()
        };
        let mut v = ServiceSpec {
            cluster_ip: Some("10.96.0.3".to_string()),
            ..Default::default()
        };
        // Identical modulo clusterIP: no update.
        assert!(check_service_spec_equality(&p, &v).is_none());

        v.external_name = Some("example.com".to_string());
        let updated = check_service_spec_equality(&p, &v).unwrap();
        assert_eq!(updated.cluster_ip.as_deref(), Some("10.0.0.7"));
        assert_eq!(updated.external_name.as_deref(), Some("example.com"));
        p.external_name = Some("example.com".to_string());
        assert!(check_service_spec_equality(&p, &v).is_none());
    }

    #[test]
    fn binary_data_diff() {
        let mut a = BTreeMap::new();
        a.insert("k".to_string(), ByteString(b"v1".to_vec()));
        let mut b = BTreeMap::new();
        b.insert("k".to_string(), ByteString(b"v2".to_vec()));
        let (updated, equal) = check_binary_data_equality(Some(&a), Some(&b));
        assert!(!equal);
        assert_eq!(updated.unwrap().get("k").unwrap().0, b"v2");
        let (updated, equal) = check_binary_data_equality(Some(&a), Some(&a.clone()));
        assert!(equal);
        assert!(updated.is_none());
    }

    #[test]
    fn sa_token_secret_ignores_tenant_edits() {
        let mut data = BTreeMap::new();
        data.insert("token".to_string(), ByteString(b"super-minted".to_vec()));
        let p = Secret {
            type_: Some(SERVICE_ACCOUNT_TOKEN_TYPE.to_string()),
            data: Some(data),
            ..Default::default()
        };
        let mut edited = BTreeMap::new();
        edited.insert("token".to_string(), ByteString(b"user-edit".to_vec()));
        let v = Secret {
            type_: Some(SERVICE_ACCOUNT_TOKEN_TYPE.to_string()),
            data: Some(edited),
            ..Default::default()
        };
        assert!(check_secret_equality(&p, &v).is_none());

        // An ordinary secret follows the tenant.
        let p2 = Secret {
            data: p.data.clone(),
            ..Default::default()
        };
        let v2 = Secret {
            data: v.data.clone(),
            ..Default::default()
        };
        let updated = check_secret_equality(&p2, &v2).unwrap();
        assert_eq!(updated.data.unwrap().get("token").unwrap().0, b"user-edit");
    }

    #[test]
    fn only_transparent_keys_flow_upward() {
        let mut p_ann = BTreeMap::new();
        p_ann.insert(
            "transparency.tenancy.x-k8s.io/scheduler-note".to_string(),
            "placed".to_string(),
        );
        p_ann.insert("tenancy.x-k8s.io/uid".to_string(), "u-1".to_string());
        p_ann.insert("random".to_string(), "nope".to_string());
        let p_meta = ObjectMeta {
            annotations: Some(p_ann),
            ..Default::default()
        };
        let v_meta = ObjectMeta::default();
        let updated = check_uw_meta_equality(&cfg(), &p_meta, &v_meta).unwrap();
        let ann = updated.annotations.unwrap();
        assert_eq!(
            ann.get("transparency.tenancy.x-k8s.io/scheduler-note").unwrap(),
            "placed"
        );
        assert!(!ann.contains_key("tenancy.x-k8s.io/uid"));
        assert!(!ann.contains_key("random"));

        // Idempotent: applying again reports no drift.
        let v_meta2 = ObjectMeta {
            annotations: Some(ann),
            ..Default::default()
        };
        assert!(check_uw_meta_equality(&cfg(), &p_meta, &v_meta2).is_none());
    }
}
