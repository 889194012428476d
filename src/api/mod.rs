pub mod conversion;
pub mod v1alpha1;
pub mod v1alpha2;

use serde::Serialize;
use std::fmt;

pub const GROUP: &str = "hnc.x-k8s.io";

/// Singleton object names.
pub const HIERARCHY_SINGLETON: &str = "hierarchy";
pub const CONFIG_SINGLETON: &str = "config";

/// Annotations on namespaces and propagated objects.
pub const ANNOTATION_SUBNAMESPACE_OF: &str = "hnc.x-k8s.io/subnamespace-of";
pub const ANNOTATION_INHERITED_FROM: &str = "hnc.x-k8s.io/inherited-from";
pub const ANNOTATION_MANAGED_BY: &str = "hnc.x-k8s.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "canopy";

/// Propagation exception annotations on source objects.
pub const ANNOTATION_TREE_SELECT: &str = "propagate.hnc.x-k8s.io/treeSelect";
pub const ANNOTATION_SELECT: &str = "propagate.hnc.x-k8s.io/select";
pub const ANNOTATION_NONE: &str = "propagate.hnc.x-k8s.io/none";

/// Tree labels: `<ancestor>.tree.hnc.x-k8s.io/depth = <n>`.
pub const TREE_LABEL_SUFFIX: &str = ".tree.hnc.x-k8s.io/depth";

pub const ANCHOR_FINALIZER: &str = "hnc.x-k8s.io/anchor-cleanup";

/// Condition types and reasons on HierarchyConfiguration.
pub const CONDITION_ACTIVITIES_HALTED: &str = "ActivitiesHalted";
pub const CONDITION_ANCHOR_MISSING: &str = "SubnamespaceAnchorMissing";
pub const CONDITION_BAD_CONFIGURATION: &str = "BadConfiguration";
/// Rejections that an admission webhook would have refused outright, kept
/// distinguishable from ordinary misconfiguration.
pub const CONDITION_FORBIDDEN: &str = "Forbidden";
pub const REASON_PARENT_MISSING: &str = "ParentMissing";
pub const REASON_ANCESTOR_HALTED: &str = "AncestorHaltActivities";
pub const REASON_TYPE_NOT_FOUND: &str = "TypeNotFound";
pub const REASON_ENFORCED_MODE: &str = "CannotChangeEnforcedMode";

/// Event (and condition) codes for propagation failures.
pub const EVENT_CANNOT_PROPAGATE: &str = "CannotPropagateObject";
pub const EVENT_CANNOT_UPDATE: &str = "CannotUpdateObject";
pub const EVENT_NOT_SUPPORTED: &str = "NotSupported";

pub fn tree_label(ancestor: &str) -> String {
    format!("{ancestor}{TREE_LABEL_SUFFIX}")
}

/// Identity of a propagatable resource kind: API group plus plural resource
/// name. The core group is the empty string.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TypeKey {
    pub group: String,
    pub resource: String,
}

impl TypeKey {
    pub fn new(group: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            resource: resource.into(),
        }
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.resource)
        } else {
            write!(f, "{}.{}", self.resource, self.group)
        }
    }
}
