//! One-shot, bit-exact conversion from the retired v1alpha1 API to
//! v1alpha2: annotation renames, condition recoding, and the
//! types-to-resources table rewrite.

use std::collections::BTreeMap;

use crate::api::v1alpha1::{
    ConditionV1, HNCConfigurationV1, HierarchyConfigurationV1, LEGACY_ANNOTATION_MANAGED_BY,
    LEGACY_ANNOTATION_SUBNAMESPACE_OF, LEGACY_CRIT_ANCESTOR, LEGACY_CRIT_PARENT_MISSING,
};
use crate::api::v1alpha2::{
    Condition, HNCConfigurationSpec, HierarchyConfigurationSpec, HierarchyConfigurationStatus,
    ResourceSpec, SyncMode,
};
use crate::api::{
    ANNOTATION_MANAGED_BY, ANNOTATION_SUBNAMESPACE_OF, CONDITION_ACTIVITIES_HALTED,
    CONDITION_BAD_CONFIGURATION, REASON_ANCESTOR_HALTED, REASON_PARENT_MISSING,
    REASON_TYPE_NOT_FOUND, TypeKey,
};
use crate::errors::{Error, Result};

/// Maps v1alpha1 `(apiVersion, kind)` pairs onto group+resource identities.
/// The builtin table covers the kinds the original system shipped; the
/// config reconciler extends it from live discovery data.
#[derive(Clone, Debug, Default)]
pub struct KindTable {
    entries: BTreeMap<(String, String), TypeKey>,
}

impl KindTable {
    pub fn builtin() -> Self {
        let mut t = Self::default();
        t.insert("v1", "Secret", TypeKey::new("", "secrets"));
        t.insert("v1", "ConfigMap", TypeKey::new("", "configmaps"));
        t.insert("v1", "ResourceQuota", TypeKey::new("", "resourcequotas"));
        t.insert("v1", "LimitRange", TypeKey::new("", "limitranges"));
        t.insert(
            "rbac.authorization.k8s.io/v1",
            "Role",
            TypeKey::new("rbac.authorization.k8s.io", "roles"),
        );
        t.insert(
            "rbac.authorization.k8s.io/v1",
            "RoleBinding",
            TypeKey::new("rbac.authorization.k8s.io", "rolebindings"),
        );
        t.insert(
            "networking.k8s.io/v1",
            "NetworkPolicy",
            TypeKey::new("networking.k8s.io", "networkpolicies"),
        );
        t
    }

    pub fn insert(&mut self, api_version: &str, kind: &str, key: TypeKey) {
        self.entries
            .insert((api_version.to_string(), kind.to_string()), key);
    }

    pub fn resolve(&self, api_version: &str, kind: &str) -> Option<&TypeKey> {
        self.entries
            .get(&(api_version.to_string(), kind.to_string()))
    }
}

/// Renames the legacy annotations in place. Where both spellings are
/// present the new one wins and the legacy key is dropped.
pub fn convert_annotations(annotations: &mut BTreeMap<String, String>) {
    for (old, new) in [
        (LEGACY_ANNOTATION_MANAGED_BY, ANNOTATION_MANAGED_BY),
        (LEGACY_ANNOTATION_SUBNAMESPACE_OF, ANNOTATION_SUBNAMESPACE_OF),
    ] {
        if let Some(value) = annotations.remove(old) {
            annotations.entry(new.to_string()).or_insert(value);
        }
    }
}

fn convert_condition(c: &ConditionV1) -> Condition {
    let (type_, reason) = match c.code.as_str() {
        LEGACY_CRIT_PARENT_MISSING => (CONDITION_ACTIVITIES_HALTED, REASON_PARENT_MISSING),
        LEGACY_CRIT_ANCESTOR => (CONDITION_ACTIVITIES_HALTED, REASON_ANCESTOR_HALTED),
        // Unknown legacy codes carry over verbatim so nothing is lost.
        other => (other, other),
    };
    Condition::new(type_, reason, c.msg.clone())
}

pub fn convert_hierarchy(
    old: &HierarchyConfigurationV1,
) -> (HierarchyConfigurationSpec, HierarchyConfigurationStatus) {
    let spec = HierarchyConfigurationSpec {
        parent: old.spec.parent.clone(),
        allow_cascading_deletion: old.spec.allow_cascading_delete,
    };
    let status = HierarchyConfigurationStatus {
        children: old.status.children.clone(),
        conditions: old.status.conditions.iter().map(convert_condition).collect(),
    };
    (spec, status)
}

pub fn parse_legacy_mode(mode: &str) -> Option<SyncMode> {
    match mode {
        "propagate" => Some(SyncMode::Propagate),
        "remove" => Some(SyncMode::Remove),
        // v1alpha1 treated an unset mode as propagate.
        "" => Some(SyncMode::Propagate),
        "ignore" => Some(SyncMode::Ignore),
        _ => None,
    }
}

/// Converts the v1alpha1 types table. Kinds the table cannot resolve (and
/// unknown mode spellings) surface as `TypeNotFound` conditions rather than
/// failing the whole conversion.
pub fn convert_config(
    old: &HNCConfigurationV1,
    kinds: &KindTable,
) -> (HNCConfigurationSpec, Vec<Condition>) {
    let mut resources = Vec::new();
    let mut conditions = Vec::new();
    for t in &old.spec.types {
        let Some(key) = kinds.resolve(&t.api_version, &t.kind) else {
            conditions.push(Condition::new(
                CONDITION_BAD_CONFIGURATION,
                REASON_TYPE_NOT_FOUND,
                format!("unknown type {} {}", t.api_version, t.kind),
            ));
            continue;
        };
        let Some(mode) = parse_legacy_mode(&t.mode) else {
            conditions.push(Condition::new(
                CONDITION_BAD_CONFIGURATION,
                REASON_TYPE_NOT_FOUND,
                format!("unknown mode '{}' for {} {}", t.mode, t.api_version, t.kind),
            ));
            continue;
        };
        resources.push(ResourceSpec {
            group: key.group.clone(),
            resource: key.resource.clone(),
            mode,
        });
    }
    (HNCConfigurationSpec { resources }, conditions)
}

/// The admission-path check for mode transitions: turning propagation on
/// for a kind that already has destination copies in place must be an
/// explicit decision.
pub fn validate_mode_change(old: Option<SyncMode>, new: SyncMode, force: bool) -> Result<()> {
    validate_mode_change_for("", old, new, force)
}

pub fn validate_mode_change_for(
    resource: &str,
    old: Option<SyncMode>,
    new: SyncMode,
    force: bool,
) -> Result<()> {
    if old == Some(SyncMode::Ignore) && new == SyncMode::Propagate && !force {
        return Err(Error::ForceRequired {
            resource: resource.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1alpha1::{HNCConfigurationSpecV1, HierarchySpecV1, HierarchyStatusV1, TypeSyncV1};

    fn legacy_hierarchy() -> HierarchyConfigurationV1 {
        HierarchyConfigurationV1 {
            spec: HierarchySpecV1 {
                parent: Some("acme-org".to_string()),
                allow_cascading_delete: true,
            },
            status: HierarchyStatusV1 {
                children: vec!["team-a".to_string(), "team-b".to_string()],
                conditions: vec![
                    ConditionV1 {
                        code: LEGACY_CRIT_PARENT_MISSING.to_string(),
                        msg: "parent gone".to_string(),
                        affects: vec![],
                    },
                    ConditionV1 {
                        code: LEGACY_CRIT_ANCESTOR.to_string(),
                        msg: "ancestor halted".to_string(),
                        affects: vec![],
                    },
                ],
            },
        }
    }

    #[test]
    fn hierarchy_round_trips_parent_flag_and_conditions() {
        let (spec, status) = convert_hierarchy(&legacy_hierarchy());
        assert_eq!(spec.parent.as_deref(), Some("acme-org"));
        assert!(spec.allow_cascading_deletion);
        assert_eq!(status.children, vec!["team-a", "team-b"]);
        assert_eq!(status.conditions[0].type_, CONDITION_ACTIVITIES_HALTED);
        assert_eq!(status.conditions[0].reason, REASON_PARENT_MISSING);
        assert_eq!(status.conditions[1].reason, REASON_ANCESTOR_HALTED);
    }

    #[test]
    fn annotation_rename_new_wins() {
        let mut ann = BTreeMap::new();
        ann.insert(LEGACY_ANNOTATION_MANAGED_BY.to_string(), "old".to_string());
        ann.insert(ANNOTATION_MANAGED_BY.to_string(), "new".to_string());
        ann.insert(
            LEGACY_ANNOTATION_SUBNAMESPACE_OF.to_string(),
            "parent-ns".to_string(),
        );
        convert_annotations(&mut ann);
        assert_eq!(ann.get(ANNOTATION_MANAGED_BY).unwrap(), "new");
        assert_eq!(ann.get(ANNOTATION_SUBNAMESPACE_OF).unwrap(), "parent-ns");
        assert!(!ann.contains_key(LEGACY_ANNOTATION_MANAGED_BY));
        assert!(!ann.contains_key(LEGACY_ANNOTATION_SUBNAMESPACE_OF));
    }

    #[test]
    fn config_types_become_resources_and_unknowns_surface() {
        let old = HNCConfigurationV1 {
            spec: HNCConfigurationSpecV1 {
                types: vec![
                    TypeSyncV1 {
                        api_version: "v1".to_string(),
                        kind: "Secret".to_string(),
                        mode: "propagate".to_string(),
                    },
                    TypeSyncV1 {
                        api_version: "example.com/v1".to_string(),
                        kind: "Widget".to_string(),
                        mode: "propagate".to_string(),
                    },
                    TypeSyncV1 {
                        api_version: "v1".to_string(),
                        kind: "ConfigMap".to_string(),
                        mode: "frobnicate".to_string(),
                    },
                ],
            },
        };
        let (spec, conditions) = convert_config(&old, &KindTable::builtin());
        assert_eq!(spec.resources.len(), 1);
        assert_eq!(spec.resources[0].resource, "secrets");
        assert_eq!(spec.resources[0].mode, SyncMode::Propagate);
        assert_eq!(conditions.len(), 2);
        assert!(conditions.iter().all(|c| c.reason == REASON_TYPE_NOT_FOUND));
    }

    #[test]
    fn ignore_to_propagate_needs_force() {
        assert!(
            validate_mode_change(Some(SyncMode::Ignore), SyncMode::Propagate, false).is_err()
        );
        assert!(validate_mode_change(Some(SyncMode::Ignore), SyncMode::Propagate, true).is_ok());
        assert!(validate_mode_change(Some(SyncMode::Remove), SyncMode::Propagate, false).is_ok());
        assert!(validate_mode_change(None, SyncMode::Propagate, false).is_ok());
    }
}
