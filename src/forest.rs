//! In-memory authority for the namespace tree.
//!
//! One `Forest` instance lives behind a single mutex for the whole process.
//! Reconcilers and the validation entry points take the lock, read or mutate,
//! and release before doing any store I/O; retries re-check the invariants
//! after reacquiring.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use crate::api::v1alpha2::Condition;
use crate::api::{
    CONDITION_ACTIVITIES_HALTED, REASON_ANCESTOR_HALTED, REASON_PARENT_MISSING, TypeKey, tree_label,
};
use crate::errors::{Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Origin {
    #[default]
    Root,
    FullChild,
    Subnamespace,
}

#[derive(Clone, Debug, Default)]
pub struct Node {
    parent: Option<String>,
    children: BTreeSet<String>,
    origin: Origin,
    /// Whether the namespace object itself has been observed. A node can
    /// exist as a placeholder because a child declares it as parent.
    exists: bool,
    allow_cascading_deletion: bool,
    /// Anchor bookkeeping for subnamespaces: the parent recorded in the
    /// `subnamespace-of` annotation.
    subnamespace_of: Option<String>,
    /// Labels observed on the namespace object, tree labels included.
    /// `select:` exceptions match against these.
    labels: BTreeMap<String, String>,
    /// Authoritative source objects per kind in this namespace.
    local_sources: HashMap<TypeKey, BTreeSet<String>>,
    /// Conditions pushed by the propagator (CannotPropagateObject and the
    /// like); ancestry-derived conditions are computed, not stored.
    extra_conditions: Vec<Condition>,
}

impl Node {
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn exists(&self) -> bool {
        self.exists
    }
}

#[derive(Debug, Default)]
pub struct Forest {
    nodes: HashMap<String, Node>,
}

/// Snapshot of one namespace for the `/state` surface.
#[derive(Clone, Debug, Serialize)]
pub struct NamespaceSummary {
    pub name: String,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub origin: Origin,
    pub halted: bool,
}

impl Forest {
    pub fn new() -> Self {
        Self::default()
    }

    fn node_mut(&mut self, ns: &str) -> &mut Node {
        self.nodes.entry(ns.to_string()).or_default()
    }

    pub fn get(&self, ns: &str) -> Option<&Node> {
        self.nodes.get(ns)
    }

    pub fn contains(&self, ns: &str) -> bool {
        self.nodes.get(ns).map(|n| n.exists).unwrap_or(false)
    }

    pub fn namespaces(&self) -> Vec<String> {
        let mut all: Vec<String> = self.nodes.keys().cloned().collect();
        all.sort();
        all
    }

    /// Records that the namespace object has been observed.
    pub fn observe(&mut self, ns: &str) {
        self.node_mut(ns).exists = true;
    }

    /// Removes a deleted namespace. The record survives as a placeholder
    /// while children still point at it, so their ParentMissing conditions
    /// have something to hang off.
    pub fn remove(&mut self, ns: &str) {
        let keep = {
            let Some(node) = self.nodes.get_mut(ns) else {
                return;
            };
            node.exists = false;
            node.local_sources.clear();
            node.extra_conditions.clear();
            node.subnamespace_of = None;
            node.labels.clear();
            !node.children.is_empty()
        };
        if !keep {
            if let Some(node) = self.nodes.remove(ns) {
                if let Some(parent) = node.parent {
                    if let Some(p) = self.nodes.get_mut(&parent) {
                        p.children.remove(ns);
                    }
                }
            }
        }
    }

    pub fn set_cascading_deletion(&mut self, ns: &str, allow: bool) {
        self.node_mut(ns).allow_cascading_deletion = allow;
    }

    pub fn set_labels(&mut self, ns: &str, labels: BTreeMap<String, String>) {
        self.node_mut(ns).labels = labels;
    }

    pub fn labels(&self, ns: &str) -> BTreeMap<String, String> {
        self.nodes
            .get(ns)
            .map(|n| n.labels.clone())
            .unwrap_or_default()
    }

    pub fn set_subnamespace(&mut self, ns: &str, of: Option<String>) {
        let node = self.node_mut(ns);
        node.subnamespace_of = of.clone();
        node.origin = match (&of, &node.parent) {
            (Some(_), _) => Origin::Subnamespace,
            (None, Some(_)) => Origin::FullChild,
            (None, None) => Origin::Root,
        };
    }

    pub fn subnamespace_of(&self, ns: &str) -> Option<&str> {
        self.nodes.get(ns).and_then(|n| n.subnamespace_of.as_deref())
    }

    /// The webhook-facing check: does pointing `ns` at `parent` keep the
    /// graph a forest?
    pub fn validate_parent_change(&self, ns: &str, parent: Option<&str>) -> Result<()> {
        let Some(parent) = parent else {
            return Ok(());
        };
        if parent == ns || self.is_descendant(parent, ns) {
            return Err(Error::CycleDetected {
                child: ns.to_string(),
                parent: parent.to_string(),
            });
        }
        Ok(())
    }

    pub fn set_parent(&mut self, ns: &str, parent: Option<&str>) -> Result<()> {
        self.validate_parent_change(ns, parent)?;
        let old = self.node_mut(ns).parent.clone();
        if old.as_deref() == parent {
            return Ok(());
        }
        if let Some(old_parent) = old {
            if let Some(p) = self.nodes.get_mut(&old_parent) {
                p.children.remove(ns);
            }
        }
        if let Some(parent) = parent {
            self.node_mut(parent).children.insert(ns.to_string());
        }
        let node = self.node_mut(ns);
        node.parent = parent.map(str::to_string);
        if node.subnamespace_of.is_none() {
            node.origin = if parent.is_some() {
                Origin::FullChild
            } else {
                Origin::Root
            };
        }
        Ok(())
    }

    /// Whether `maybe_descendant` sits in the subtree rooted at `ns`
    /// (inclusive).
    fn is_descendant(&self, maybe_descendant: &str, ns: &str) -> bool {
        let mut current = Some(maybe_descendant.to_string());
        let mut seen = HashSet::new();
        while let Some(c) = current {
            if c == ns {
                return true;
            }
            if !seen.insert(c.clone()) {
                return false;
            }
            current = self.nodes.get(&c).and_then(|n| n.parent.clone());
        }
        false
    }

    /// Ordered ancestry, root first, `ns` last. A broken chain (missing
    /// parent record) simply ends the walk.
    pub fn ancestry(&self, ns: &str) -> Vec<String> {
        let mut chain = vec![ns.to_string()];
        let mut seen: HashSet<String> = chain.iter().cloned().collect();
        let mut current = self.nodes.get(ns).and_then(|n| n.parent.clone());
        while let Some(p) = current {
            if !seen.insert(p.clone()) {
                break;
            }
            chain.push(p.clone());
            current = self.nodes.get(&p).and_then(|n| n.parent.clone());
        }
        chain.reverse();
        chain
    }

    pub fn children(&self, ns: &str) -> Vec<String> {
        self.nodes
            .get(ns)
            .map(|n| n.children.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All strict descendants, breadth-first.
    pub fn descendants(&self, ns: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut queue: VecDeque<String> = self.children(ns).into();
        let mut seen = HashSet::new();
        while let Some(d) = queue.pop_front() {
            if !seen.insert(d.clone()) {
                continue;
            }
            queue.extend(self.children(&d));
            out.push(d);
        }
        out
    }

    /// Subnamespace-origin strict descendants, deepest first, the order a
    /// cascading delete removes them in.
    pub fn subnamespace_descendants(&self, ns: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .descendants(ns)
            .into_iter()
            .filter(|d| {
                self.nodes
                    .get(d)
                    .map(|n| n.origin == Origin::Subnamespace)
                    .unwrap_or(false)
            })
            .collect();
        out.sort_by_key(|d| std::cmp::Reverse(self.ancestry(d).len()));
        out
    }

    /// Why this namespace is halted, if it is. ParentMissing beats the
    /// ancestor-derived reason so the root cause is the one reported.
    pub fn halted_reason(&self, ns: &str) -> Option<Condition> {
        let node = self.nodes.get(ns)?;
        if let Some(parent) = &node.parent {
            if !self.contains(parent) {
                return Some(Condition::new(
                    CONDITION_ACTIVITIES_HALTED,
                    REASON_PARENT_MISSING,
                    format!("declared parent \"{parent}\" does not exist"),
                ));
            }
        }
        let mut current = node.parent.clone();
        let mut seen = HashSet::new();
        while let Some(a) = current {
            if !seen.insert(a.clone()) {
                break;
            }
            let anc = self.nodes.get(&a)?;
            if let Some(ap) = &anc.parent {
                if !self.contains(ap) {
                    return Some(Condition::new(
                        CONDITION_ACTIVITIES_HALTED,
                        REASON_ANCESTOR_HALTED,
                        format!("ancestor \"{a}\" has halted activities"),
                    ));
                }
            }
            current = anc.parent.clone();
        }
        None
    }

    pub fn is_halted(&self, ns: &str) -> bool {
        self.halted_reason(ns).is_some()
    }

    /// Namespaces whose ancestor-derived conditions must be recomputed when
    /// `ns` changes: the namespace itself plus its whole subtree.
    pub fn descendants_halted_by(&self, ns: &str) -> Vec<String> {
        let mut out = vec![ns.to_string()];
        out.extend(self.descendants(ns));
        out
    }

    /// Deletion guard: a namespace with subnamespace children may only go
    /// away when cascading deletion is allowed on it or on an ancestor.
    pub fn validate_namespace_delete(&self, ns: &str) -> Result<()> {
        let has_subnamespace_children = self.children(ns).iter().any(|c| {
            self.nodes
                .get(c)
                .map(|n| n.origin == Origin::Subnamespace)
                .unwrap_or(false)
        });
        if !has_subnamespace_children {
            return Ok(());
        }
        if self.cascading_deletion_allowed(ns) {
            return Ok(());
        }
        Err(Error::CascadeForbidden {
            namespace: ns.to_string(),
        })
    }

    pub fn cascading_deletion_allowed(&self, ns: &str) -> bool {
        self.ancestry(ns).iter().any(|a| {
            self.nodes
                .get(a)
                .map(|n| n.allow_cascading_deletion)
                .unwrap_or(false)
        })
    }

    // Source bookkeeping used by the propagator.

    pub fn register_local_source(&mut self, ns: &str, kind: &TypeKey, name: &str) {
        self.node_mut(ns)
            .local_sources
            .entry(kind.clone())
            .or_default()
            .insert(name.to_string());
    }

    pub fn unregister_local_source(&mut self, ns: &str, kind: &TypeKey, name: &str) {
        if let Some(node) = self.nodes.get_mut(ns) {
            if let Some(set) = node.local_sources.get_mut(kind) {
                set.remove(name);
                if set.is_empty() {
                    node.local_sources.remove(kind);
                }
            }
        }
    }

    pub fn has_local_source(&self, ns: &str, kind: &TypeKey, name: &str) -> bool {
        self.nodes
            .get(ns)
            .and_then(|n| n.local_sources.get(kind))
            .map(|set| set.contains(name))
            .unwrap_or(false)
    }

    pub fn local_source_names(&self, ns: &str, kind: &TypeKey) -> Vec<String> {
        self.nodes
            .get(ns)
            .and_then(|n| n.local_sources.get(kind))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn local_source_count(&self, kind: &TypeKey) -> u64 {
        self.nodes
            .values()
            .filter_map(|n| n.local_sources.get(kind))
            .map(|s| s.len() as u64)
            .sum()
    }

    /// The ancestor whose copy of `kind/name` is authoritative for `ns`:
    /// nearest strict ancestor holding it wins; at equal distance the
    /// lexicographically smaller namespace name would win. Equal distances
    /// cannot arise in a tree, but the guard keeps the policy total.
    pub fn propagation_source_for(&self, ns: &str, kind: &TypeKey, name: &str) -> Option<String> {
        let ancestry = self.ancestry(ns);
        let mut candidates: Vec<(usize, String)> = Vec::new();
        // ancestry is root..=ns; distance counts hops upward from ns.
        for (i, a) in ancestry.iter().rev().enumerate().skip(1) {
            if self.has_local_source(a, kind, name) {
                candidates.push((i, a.clone()));
            }
        }
        candidates
            .into_iter()
            .min_by(|(da, na), (db, nb)| da.cmp(db).then_with(|| na.cmp(nb)))
            .map(|(_, ns)| ns)
    }

    // Propagator-owned conditions.

    pub fn set_extra_condition(&mut self, ns: &str, condition: Condition) {
        let node = self.node_mut(ns);
        if !node.extra_conditions.iter().any(|c| c.same_as(&condition)) {
            node.extra_conditions.push(condition);
        }
    }

    pub fn clear_extra_conditions(&mut self, ns: &str, reason: &str) {
        if let Some(node) = self.nodes.get_mut(ns) {
            node.extra_conditions.retain(|c| c.reason != reason);
        }
    }

    pub fn extra_conditions(&self, ns: &str) -> Vec<Condition> {
        self.nodes
            .get(ns)
            .map(|n| n.extra_conditions.clone())
            .unwrap_or_default()
    }

    /// Tree labels for the namespace object: every ancestor (self included)
    /// mapped to its depth below it.
    pub fn tree_labels(&self, ns: &str) -> BTreeMap<String, String> {
        let ancestry = self.ancestry(ns);
        let len = ancestry.len();
        ancestry
            .into_iter()
            .enumerate()
            .map(|(i, a)| (tree_label(&a), (len - 1 - i).to_string()))
            .collect()
    }

    pub fn summaries(&self) -> Vec<NamespaceSummary> {
        let mut out: Vec<NamespaceSummary> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.exists)
            .map(|(name, n)| NamespaceSummary {
                name: name.clone(),
                parent: n.parent.clone(),
                children: n.children.iter().cloned().collect(),
                origin: n.origin,
                halted: self.is_halted(name),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
