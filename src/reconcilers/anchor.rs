//! Subnamespace-anchor reconciler: creates child namespaces declared by
//! anchors, reports conflicts without ever mutating a namespace it does not
//! own, and drives cascading deletion through the anchor finalizer.

use futures::Stream;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::ResourceExt;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::api::v1alpha2::{
    AnchorState, HierarchyConfiguration, HierarchyConfigurationSpec, SubnamespaceAnchor,
    SubnamespaceAnchorStatus,
};
use crate::api::{ANCHOR_FINALIZER, ANNOTATION_SUBNAMESPACE_OF, HIERARCHY_SINGLETON};
use crate::errors::Error;
use crate::reconcilers::{Context, ensure_finalizer, remove_finalizer};

pub fn controller(
    ctx: Arc<Context>,
) -> impl Stream<
    Item = Result<
        (ObjectRef<SubnamespaceAnchor>, Action),
        kube::runtime::controller::Error<Error, watcher::Error>,
    >,
> {
    Controller::new(
        Api::<SubnamespaceAnchor>::all(ctx.client.clone()),
        watcher::Config::default().any_semantic(),
    )
    .watches(
        Api::<Namespace>::all(ctx.client.clone()),
        watcher::Config::default().any_semantic(),
        |ns: Namespace| {
            // A subnamespace event re-triggers the anchor that owns it.
            let parent = ns.annotations().get(ANNOTATION_SUBNAMESPACE_OF)?.clone();
            Some(ObjectRef::<SubnamespaceAnchor>::new(&ns.name_any()).within(&parent))
        },
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
}

/// Names the anchor reconciler refuses to manage as subnamespaces.
pub fn forbidden_child_name(parent: &str, child: &str) -> bool {
    child == parent || child == "default" || child.starts_with("kube-")
}

/// The webhook-facing check for anchor deletion: an anchor whose
/// subnamespace has subnamespace descendants may only be deleted once
/// cascading deletion is allowed somewhere on the chain.
pub fn validate_anchor_delete(ctx: &Context, parent: &str, child: &str) -> Result<(), Error> {
    let forest = ctx.forest.lock().unwrap();
    if forest.subnamespace_of(child) != Some(parent) {
        return Ok(());
    }
    forest.validate_namespace_delete(child)
}

async fn reconcile(anchor: Arc<SubnamespaceAnchor>, ctx: Arc<Context>) -> Result<Action, Error> {
    let Some(parent) = anchor.namespace() else {
        return Ok(Action::await_change());
    };
    let child = anchor.name_any();
    let anchors: Api<SubnamespaceAnchor> = Api::namespaced(ctx.client.clone(), &parent);

    if anchor.metadata.deletion_timestamp.is_some() {
        return finalize(&anchors, &anchor, &parent, &child, &ctx).await;
    }

    ensure_finalizer(&anchors, anchor.as_ref(), ANCHOR_FINALIZER).await?;

    if forbidden_child_name(&parent, &child) {
        return update_status(&anchors, &anchor, AnchorState::Forbidden).await;
    }

    let namespaces: Api<Namespace> = Api::all(ctx.client.clone());
    let state = match namespaces.get_opt(&child).await? {
        None => {
            create_subnamespace(&ctx, &parent, &child).await?;
            AnchorState::Missing
        }
        Some(ns) if ns.metadata.deletion_timestamp.is_some() => {
            // Leftover from a previous cascading delete; wait it out and
            // recreate from scratch afterwards.
            return Ok(Action::requeue(Duration::from_secs(5)));
        }
        Some(ns) => match ns.annotations().get(ANNOTATION_SUBNAMESPACE_OF) {
            Some(of) if of == &parent => {
                let observed = {
                    let forest = ctx.forest.lock().unwrap();
                    forest.get(&child).and_then(|n| n.parent().map(str::to_string))
                };
                if observed.as_deref() == Some(parent.as_str()) {
                    AnchorState::Ok
                } else {
                    AnchorState::Missing
                }
            }
            // Someone else's namespace, or one whose annotation was removed
            // by hand; never mutate it from here.
            _ => AnchorState::Conflict,
        },
    };

    update_status(&anchors, &anchor, state).await
}

async fn create_subnamespace(ctx: &Context, parent: &str, child: &str) -> Result<(), Error> {
    let namespaces: Api<Namespace> = Api::all(ctx.client.clone());
    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_SUBNAMESPACE_OF.to_string(), parent.to_string());
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(child.to_string()),
            annotations: Some(annotations),
            ..Default::default()
        },
        ..Default::default()
    };
    info!(namespace = %child, parent = %parent, "creating subnamespace");
    match namespaces.create(&PostParams::default(), &ns).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 409 => {}
        Err(e) => return Err(e.into()),
    }

    // The subnamespace gets a fresh hierarchy singleton pointing at the
    // anchor's namespace. Recreation starts clean: a singleton surviving
    // from an earlier life of this namespace is overwritten, never trusted.
    let hierarchies: Api<HierarchyConfiguration> = Api::namespaced(ctx.client.clone(), child);
    let spec = HierarchyConfigurationSpec {
        parent: Some(parent.to_string()),
        allow_cascading_deletion: false,
    };
    match hierarchies.get_opt(HIERARCHY_SINGLETON).await? {
        None => {
            let mut hc = HierarchyConfiguration::new(HIERARCHY_SINGLETON, spec);
            hc.metadata.namespace = Some(child.to_string());
            match hierarchies.create(&PostParams::default(), &hc).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 409 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Some(_) => {
            warn!(namespace = %child, "resetting stale hierarchy singleton on recreated subnamespace");
            let patch = json!({"spec": spec});
            hierarchies
                .patch(
                    HIERARCHY_SINGLETON,
                    &PatchParams::default(),
                    &Patch::Merge(&patch),
                )
                .await?;
        }
    }
    Ok(())
}

async fn finalize(
    anchors: &Api<SubnamespaceAnchor>,
    anchor: &SubnamespaceAnchor,
    parent: &str,
    child: &str,
    ctx: &Context,
) -> Result<Action, Error> {
    let owned = {
        let forest = ctx.forest.lock().unwrap();
        forest.subnamespace_of(child) == Some(parent)
    };

    if owned {
        if let Err(e) = validate_anchor_delete(ctx, parent, child) {
            // The webhook rejects this; if it happened anyway the anchor
            // stays terminating until the subtree allows deletion.
            warn!(namespace = %child, error = %e, "anchor deletion blocked");
            return Ok(Action::requeue(Duration::from_secs(30)));
        }
        let namespaces: Api<Namespace> = Api::all(ctx.client.clone());
        info!(namespace = %child, parent = %parent, "deleting subnamespace for removed anchor");
        match namespaces.delete(child, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    } else {
        // Faulty-anchor resilience: a namespace that no longer points at
        // this anchor survives the anchor's deletion untouched.
        info!(namespace = %child, parent = %parent, "anchor removed; namespace not owned, leaving it");
    }

    remove_finalizer(anchors, anchor, ANCHOR_FINALIZER).await?;
    Ok(Action::await_change())
}

async fn update_status(
    anchors: &Api<SubnamespaceAnchor>,
    anchor: &SubnamespaceAnchor,
    state: AnchorState,
) -> Result<Action, Error> {
    let current = anchor.status.clone().unwrap_or_default();
    if current.status != state {
        let patch = json!({"status": SubnamespaceAnchorStatus { status: state }});
        anchors
            .patch_status(
                &anchor.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
    }
    // Missing resolves through namespace events; Ok/Conflict/Forbidden wait
    // for object changes.
    match state {
        AnchorState::Missing => Ok(Action::requeue(Duration::from_secs(5))),
        _ => Ok(Action::await_change()),
    }
}

fn error_policy(_anchor: Arc<SubnamespaceAnchor>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(error = %error, "anchor reconcile failed");
    Action::requeue(Duration::from_secs(30))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_names() {
        assert!(forbidden_child_name("team-a", "team-a"));
        assert!(forbidden_child_name("team-a", "kube-system"));
        assert!(forbidden_child_name("team-a", "default"));
        assert!(!forbidden_child_name("team-a", "service-1"));
    }
}
