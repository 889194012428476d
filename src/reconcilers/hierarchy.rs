//! Namespace and hierarchy reconcilers: converge the forest to the declared
//! parent/child graph, keep tree labels on namespace objects, and report
//! conditions on the `hierarchy` singleton.

use futures::Stream;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::api::v1alpha2::{
    Condition, HierarchyConfiguration, HierarchyConfigurationStatus, SubnamespaceAnchor,
    conditions_equal,
};
use crate::api::{
    ANNOTATION_SUBNAMESPACE_OF, CONDITION_ANCHOR_MISSING, CONDITION_BAD_CONFIGURATION,
    HIERARCHY_SINGLETON, TREE_LABEL_SUFFIX,
};
use crate::errors::Error;
use crate::forest::Origin;
use crate::reconcilers::Context;

pub fn namespace_controller(
    ctx: Arc<Context>,
) -> impl Stream<
    Item = Result<
        (ObjectRef<Namespace>, Action),
        kube::runtime::controller::Error<Error, watcher::Error>,
    >,
> {
    Controller::new(
        Api::<Namespace>::all(ctx.client.clone()),
        watcher::Config::default().any_semantic(),
    )
    .shutdown_on_signal()
    .run(reconcile_namespace, error_policy::<Namespace>, ctx)
}

pub fn hierarchy_controller(
    ctx: Arc<Context>,
) -> impl Stream<
    Item = Result<
        (ObjectRef<HierarchyConfiguration>, Action),
        kube::runtime::controller::Error<Error, watcher::Error>,
    >,
> {
    let forest = ctx.forest.clone();
    Controller::new(
        Api::<HierarchyConfiguration>::all(ctx.client.clone()),
        watcher::Config::default().any_semantic(),
    )
    .watches(
        Api::<Namespace>::all(ctx.client.clone()),
        watcher::Config::default().any_semantic(),
        // A namespace event invalidates ancestry-derived conditions for its
        // whole subtree, so the singletons of all descendants re-reconcile.
        move |ns: Namespace| {
            let affected = forest
                .lock()
                .unwrap()
                .descendants_halted_by(&ns.name_any());
            affected
                .into_iter()
                .map(|d| ObjectRef::<HierarchyConfiguration>::new(HIERARCHY_SINGLETON).within(&d))
                .collect::<Vec<_>>()
        },
    )
    .shutdown_on_signal()
    .run(reconcile_hierarchy, error_policy::<HierarchyConfiguration>, ctx)
}

async fn reconcile_namespace(ns: Arc<Namespace>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = ns.name_any();

    if ns.metadata.deletion_timestamp.is_some() {
        return handle_namespace_deletion(&name, ctx).await;
    }

    let annotations = ns.annotations();
    let subnamespace_of = annotations.get(ANNOTATION_SUBNAMESPACE_OF).cloned();
    let labels: BTreeMap<String, String> = ns.labels().clone();

    let (desired_labels, affected) = {
        let mut forest = ctx.forest.lock().unwrap();
        forest.observe(&name);
        forest.set_labels(&name, labels.clone());
        forest.set_subnamespace(&name, subnamespace_of.clone());
        if let Some(parent) = &subnamespace_of {
            // The annotation is authoritative for subnamespaces; a cycle here
            // means someone hand-edited it, so leave the old parent in place.
            if let Err(e) = forest.set_parent(&name, Some(parent)) {
                warn!(namespace = %name, error = %e, "ignoring subnamespace-of annotation");
            }
        }
        (forest.tree_labels(&name), forest.descendants_halted_by(&name))
    };

    patch_tree_labels(&ctx, &name, &labels, &desired_labels).await?;
    ctx.propagator.request(affected);

    debug!(namespace = %name, "reconciled namespace");
    Ok(Action::await_change())
}

async fn handle_namespace_deletion(name: &str, ctx: Arc<Context>) -> Result<Action, Error> {
    let (cascade_children, affected) = {
        let mut forest = ctx.forest.lock().unwrap();
        let affected = forest.descendants_halted_by(name);
        let cascade: Vec<String> = if forest.cascading_deletion_allowed(name) {
            forest
                .children(name)
                .into_iter()
                .filter(|c| {
                    forest
                        .get(c)
                        .map(|n| n.origin() == Origin::Subnamespace)
                        .unwrap_or(false)
                })
                .collect()
        } else {
            Vec::new()
        };
        forest.remove(name);
        (cascade, affected)
    };

    let namespaces: Api<Namespace> = Api::all(ctx.client.clone());
    for child in cascade_children {
        info!(namespace = %child, parent = %name, "cascading delete of subnamespace");
        match namespaces.delete(&child, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }

    ctx.propagator.request(affected);
    Ok(Action::await_change())
}

/// Applies the computed tree labels to the namespace, removing stale depth
/// labels, with a no-op fast path.
async fn patch_tree_labels(
    ctx: &Context,
    name: &str,
    current: &BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
) -> Result<(), Error> {
    let mut patch_labels = Map::new();
    for (k, v) in desired {
        if current.get(k) != Some(v) {
            patch_labels.insert(k.clone(), Value::String(v.clone()));
        }
    }
    for k in current.keys() {
        if k.ends_with(TREE_LABEL_SUFFIX) && !desired.contains_key(k) {
            patch_labels.insert(k.clone(), Value::Null);
        }
    }
    if patch_labels.is_empty() {
        return Ok(());
    }
    let api: Api<Namespace> = Api::all(ctx.client.clone());
    let patch = json!({"metadata": {"labels": Value::Object(patch_labels)}});
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn reconcile_hierarchy(
    hc: Arc<HierarchyConfiguration>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let Some(ns) = hc.namespace() else {
        return Ok(Action::await_change());
    };
    if hc.name_any() != HIERARCHY_SINGLETON {
        warn!(namespace = %ns, name = %hc.name_any(), "ignoring non-singleton hierarchy object");
        return Ok(Action::await_change());
    }

    let declared_parent = hc.spec.parent.clone().filter(|p| !p.is_empty());
    let mut cycle: Option<String> = None;

    let (mut conditions, children, origin, subnamespace_of, parent_changed, affected) = {
        let mut forest = ctx.forest.lock().unwrap();
        let old_parent = forest.get(&ns).and_then(|n| n.parent().map(str::to_string));
        let mut conditions = Vec::new();

        match forest.set_parent(&ns, declared_parent.as_deref()) {
            Ok(()) => {}
            Err(e @ Error::CycleDetected { .. }) => {
                // The webhook rejects cycles; if one lands in the store
                // anyway, report it and keep the last good parent.
                cycle = Some(e.to_string());
                conditions.push(Condition::new(
                    CONDITION_BAD_CONFIGURATION,
                    "CycleDetected",
                    e.to_string(),
                ));
            }
            Err(e) => return Err(e),
        }
        forest.set_cascading_deletion(&ns, hc.spec.allow_cascading_deletion);

        if let Some(halted) = forest.halted_reason(&ns) {
            conditions.push(halted);
        }
        conditions.extend(forest.extra_conditions(&ns));

        let children = forest.children(&ns);
        let origin = forest.get(&ns).map(|n| n.origin()).unwrap_or(Origin::Root);
        let subnamespace_of = forest.subnamespace_of(&ns).map(str::to_string);
        let parent_changed = old_parent.as_deref() != declared_parent.as_deref();
        let affected = forest.descendants_halted_by(&ns);
        (
            conditions,
            children,
            origin,
            subnamespace_of,
            parent_changed,
            affected,
        )
    };

    if let Some(message) = cycle {
        ctx.warn_event(&hc.object_ref(&()), "CycleDetected", message)
            .await;
    }

    // A subnamespace whose anchor is gone reports it, but nothing is
    // deleted or recreated on its behalf.
    if origin == Origin::Subnamespace {
        if let Some(anchor_parent) = subnamespace_of {
            let anchors: Api<SubnamespaceAnchor> =
                Api::namespaced(ctx.client.clone(), &anchor_parent);
            if anchors.get_opt(&ns).await?.is_none() {
                conditions.push(Condition::new(
                    CONDITION_ANCHOR_MISSING,
                    CONDITION_ANCHOR_MISSING,
                    format!("anchor \"{ns}\" is missing in parent \"{anchor_parent}\""),
                ));
            }
        }
    }

    let desired = HierarchyConfigurationStatus {
        children,
        conditions,
    };
    let current = hc.status.clone().unwrap_or_default();
    if current.children != desired.children
        || !conditions_equal(&current.conditions, &desired.conditions)
    {
        let api: Api<HierarchyConfiguration> = Api::namespaced(ctx.client.clone(), &ns);
        let patch = json!({"status": desired});
        api.patch_status(
            HIERARCHY_SINGLETON,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
    }

    if parent_changed {
        info!(
            namespace = %ns,
            parent = %declared_parent.as_deref().unwrap_or("<none>"),
            "hierarchy changed"
        );
        ctx.propagator.request(affected);
    }

    Ok(Action::await_change())
}

fn error_policy<K>(_obj: Arc<K>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(error = %error, "hierarchy reconcile failed");
    if error.is_transient() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(Duration::from_secs(30))
    }
}
