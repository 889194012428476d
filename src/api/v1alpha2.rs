//! The v1alpha2 CRD surface: the per-namespace `hierarchy` singleton, the
//! subnamespace anchor, and the cluster-wide `config` singleton.

use chrono::Utc;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A condition on one of our CRDs. Conditions are replaced wholesale on each
/// reconcile, so there is no observedGeneration bookkeeping here.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub reason: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn new(
        type_: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Some(Utc::now().to_rfc3339()),
        }
    }

    /// Equality modulo the transition timestamp, used to avoid no-op status
    /// writes.
    pub fn same_as(&self, other: &Condition) -> bool {
        self.type_ == other.type_ && self.reason == other.reason && self.message == other.message
    }
}

pub fn conditions_equal(a: &[Condition], b: &[Condition]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_as(y))
}

/// Declared hierarchy of one namespace. Singleton, always named
/// `hierarchy`.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "hnc.x-k8s.io",
    version = "v1alpha2",
    kind = "HierarchyConfiguration",
    namespaced,
    status = "HierarchyConfigurationStatus",
    plural = "hierarchyconfigurations"
)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyConfigurationSpec {
    /// Name of the parent namespace, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Allows this namespace and its subnamespace descendants to be deleted
    /// even while descendants exist.
    #[serde(default)]
    pub allow_cascading_deletion: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyConfigurationStatus {
    /// Direct children, sorted by name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Declares that a child subnamespace of the given name exists under the
/// namespace holding the anchor.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "hnc.x-k8s.io",
    version = "v1alpha2",
    kind = "SubnamespaceAnchor",
    namespaced,
    status = "SubnamespaceAnchorStatus",
    plural = "subnamespaceanchors"
)]
#[serde(rename_all = "camelCase")]
pub struct SubnamespaceAnchorSpec {}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubnamespaceAnchorStatus {
    #[serde(default)]
    pub status: AnchorState,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum AnchorState {
    /// The subnamespace has not been observed yet.
    #[default]
    Missing,
    /// The subnamespace exists and points back at this anchor.
    Ok,
    /// A namespace of this name exists but does not belong to this anchor.
    Conflict,
    /// The anchor names a namespace that may not be created (reserved name
    /// or an excluded namespace).
    Forbidden,
}

/// Cluster-wide sync configuration. Singleton, always named `config`.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "hnc.x-k8s.io",
    version = "v1alpha2",
    kind = "HNCConfiguration",
    status = "HNCConfigurationStatus",
    plural = "hncconfigurations"
)]
#[serde(rename_all = "camelCase")]
pub struct HNCConfigurationSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceSpec>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// API group of the resource; empty for the core group.
    #[serde(default)]
    pub group: String,
    /// Plural resource name, e.g. `secrets`.
    pub resource: String,
    #[serde(default)]
    pub mode: SyncMode,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum SyncMode {
    /// Copy sources into all non-excluded descendants.
    Propagate,
    /// Delete propagated copies, leave sources alone.
    Remove,
    /// Do nothing.
    #[default]
    Ignore,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HNCConfigurationStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    #[serde(default)]
    pub group: String,
    pub resource: String,
    pub mode: SyncMode,
    /// Number of authoritative source objects observed for this kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_sources: Option<u64>,
    /// Number of live propagated copies of this kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_propagated: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_mode_serializes_capitalised() {
        assert_eq!(
            serde_json::to_string(&SyncMode::Propagate).unwrap(),
            "\"Propagate\""
        );
        assert_eq!(
            serde_json::from_str::<SyncMode>("\"Remove\"").unwrap(),
            SyncMode::Remove
        );
    }

    #[test]
    fn condition_same_as_ignores_timestamp() {
        let mut a = Condition::new("ActivitiesHalted", "ParentMissing", "parent gone");
        let b = Condition::new("ActivitiesHalted", "ParentMissing", "parent gone");
        a.last_transition_time = Some("2020-01-01T00:00:00Z".to_string());
        assert!(a.same_as(&b));
        assert!(conditions_equal(&[a.clone()], &[b]));
        assert!(!conditions_equal(&[a], &[]));
    }

    #[test]
    fn hierarchy_spec_defaults() {
        let spec: HierarchyConfigurationSpec = serde_json::from_str("{}").unwrap();
        assert!(spec.parent.is_none());
        assert!(!spec.allow_cascading_deletion);
    }
}
