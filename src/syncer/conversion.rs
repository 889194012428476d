//! Metadata translation between tenant and super views: the namespace
//! mapping, the syncer annotations that bind a super object to its tenant
//! peer, and ownership checks.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

use crate::errors::{Error, Result};

pub const PREFIX: &str = "tenancy.x-k8s.io";

pub const ANNOTATION_UID: &str = "tenancy.x-k8s.io/uid";
pub const ANNOTATION_CLUSTER: &str = "tenancy.x-k8s.io/cluster";
pub const ANNOTATION_NAMESPACE: &str = "tenancy.x-k8s.io/namespace";
pub const ANNOTATION_VC_NAME: &str = "tenancy.x-k8s.io/vc-name";
pub const ANNOTATION_VC_NAMESPACE: &str = "tenancy.x-k8s.io/vc-namespace";
pub const ANNOTATION_OWNER_REFERENCES: &str = "tenancy.x-k8s.io/owner-references";
pub const ANNOTATION_SUPER_CLUSTER_IP: &str = "tenancy.x-k8s.io/super-cluster-ip";
pub const ANNOTATION_ADOPTABLE: &str = "tenancy.x-k8s.io/adoptable";

/// Service-account token secrets are found by this label rather than by
/// name: the tenant token controller mints the name, so UID is the only
/// stable handle.
pub const LABEL_SECRET_UID: &str = "tenancy.x-k8s.io/secret-uid";

/// Marks tenant-side node objects materialised by the syncer.
pub const LABEL_VIRTUAL_NODE: &str = "tenancy.x-k8s.io/virtual-node";

/// Identity of the virtual cluster a registered tenant belongs to.
#[derive(Clone, Debug, PartialEq)]
pub struct OwnerInfo {
    pub vc_name: String,
    pub vc_namespace: String,
    pub uid: String,
}

pub fn validate_cluster_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidClusterName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.len() > 63 {
        return Err(invalid("must be at most 63 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(invalid("must be a lowercase DNS-1123 label"));
    }
    Ok(())
}

/// Stable truncating hash used when a super namespace name would exceed the
/// DNS label limit. Deterministic across restarts by construction.
fn stable_hash(input: &str) -> u32 {
    let mut h: u32 = 5381;
    for b in input.bytes() {
        h = h.wrapping_mul(33) ^ u32::from(b);
    }
    h
}

/// The super-cluster namespace that holds cluster `cluster`'s tenant
/// namespace `ns`. Injective for fixed inputs and stable across restarts.
pub fn to_super(cluster: &str, ns: &str) -> String {
    let joined = format!("{cluster}-{ns}");
    if joined.len() <= 63 {
        return joined;
    }
    let digest = format!("{:08x}", stable_hash(&joined));
    format!("{}-{digest}", &joined[..54])
}

/// Whether a super object carries the virtual-owner tag. Objects without it
/// were not written by the syncer and are never touched.
pub fn is_owned_by_syncer(annotations: &BTreeMap<String, String>) -> bool {
    annotations.contains_key(ANNOTATION_CLUSTER) && annotations.contains_key(ANNOTATION_NAMESPACE)
}

pub fn super_uid(meta: &ObjectMeta) -> Option<String> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_UID))
        .filter(|u| !u.is_empty())
        .cloned()
}

pub fn owner_cluster(meta: &ObjectMeta) -> Option<String> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_CLUSTER))
        .cloned()
}

pub fn owner_namespace(meta: &ObjectMeta) -> Option<String> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_NAMESPACE))
        .cloned()
}

pub fn is_adoptable(meta: &ObjectMeta) -> bool {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_ADOPTABLE))
        .map(|v| v == "true")
        .unwrap_or(false)
}

/// Builds the metadata of a super object from its tenant peer: same name,
/// target namespace, labels carried over, annotations carried over minus
/// syncer keys, plus the binding annotations. Owner references do not
/// survive the boundary as real references; they are preserved as an
/// annotation for the upward view.
pub fn build_super_meta(
    v_meta: &ObjectMeta,
    cluster: &str,
    target_ns: &str,
    owner: &OwnerInfo,
) -> ObjectMeta {
    let mut annotations: BTreeMap<String, String> = v_meta
        .annotations
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|(k, _)| !k.starts_with(PREFIX))
        .collect();
    annotations.insert(
        ANNOTATION_UID.to_string(),
        v_meta.uid.clone().unwrap_or_default(),
    );
    annotations.insert(ANNOTATION_CLUSTER.to_string(), cluster.to_string());
    annotations.insert(
        ANNOTATION_NAMESPACE.to_string(),
        v_meta.namespace.clone().unwrap_or_default(),
    );
    annotations.insert(ANNOTATION_VC_NAME.to_string(), owner.vc_name.clone());
    annotations.insert(
        ANNOTATION_VC_NAMESPACE.to_string(),
        owner.vc_namespace.clone(),
    );
    if let Some(refs) = &v_meta.owner_references {
        if let Ok(encoded) = serde_json::to_string(refs) {
            annotations.insert(ANNOTATION_OWNER_REFERENCES.to_string(), encoded);
        }
    }

    ObjectMeta {
        name: v_meta.name.clone(),
        namespace: Some(target_ns.to_string()),
        labels: v_meta.labels.clone(),
        annotations: Some(annotations),
        ..Default::default()
    }
}
