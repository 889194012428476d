//! The retired v1alpha1 shapes, kept only as input to the one-shot
//! conversion in [`super::conversion`]. These are plain serde types; the
//! CRDs themselves are only served at v1alpha2.

use serde::{Deserialize, Serialize};

/// Legacy annotation keys replaced in v1alpha2.
pub const LEGACY_ANNOTATION_MANAGED_BY: &str = "hnc.x-k8s.io/managedBy";
pub const LEGACY_ANNOTATION_SUBNAMESPACE_OF: &str = "hnc.x-k8s.io/subnamespaceOf";

/// Legacy condition codes replaced by `ActivitiesHalted(<Reason>)`.
pub const LEGACY_CRIT_PARENT_MISSING: &str = "CritParentMissing";
pub const LEGACY_CRIT_ANCESTOR: &str = "CritAncestor";

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyConfigurationV1 {
    #[serde(default)]
    pub spec: HierarchySpecV1,
    #[serde(default)]
    pub status: HierarchyStatusV1,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchySpecV1 {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub allow_cascading_delete: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyStatusV1 {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ConditionV1>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ConditionV1 {
    pub code: String,
    #[serde(default)]
    pub msg: String,
    /// Namespaces this condition applies to, for aggregated conditions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affects: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HNCConfigurationV1 {
    #[serde(default)]
    pub spec: HNCConfigurationSpecV1,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HNCConfigurationSpecV1 {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<TypeSyncV1>,
}

/// v1alpha1 addressed kinds by apiVersion+kind and spelled modes in
/// lowercase.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeSyncV1 {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub mode: String,
}
