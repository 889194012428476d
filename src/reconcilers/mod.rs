//! The hierarchy-side controllers: namespace/hierarchy, anchor, config, and
//! the object propagator, all sharing one [`Context`].

pub mod anchor;
pub mod config;
pub mod hierarchy;
pub mod propagator;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::errors::Result;
use crate::forest::Forest;
use crate::reconcilers::propagator::Propagator;

pub struct Context {
    pub client: Client,
    pub forest: Arc<Mutex<Forest>>,
    pub recorder: Recorder,
    pub propagator: Propagator,
}

impl Context {
    pub fn new(client: Client, forest: Arc<Mutex<Forest>>, propagator: Propagator) -> Arc<Self> {
        let reporter = Reporter {
            controller: "canopy".into(),
            instance: None,
        };
        Arc::new(Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
            forest,
            propagator,
        })
    }

    /// Publishes a warning event against the given object. Event delivery is
    /// best-effort; a failure is logged and swallowed.
    pub async fn warn_event(&self, reference: &ObjectReference, reason: &str, note: String) {
        let ev = Event {
            type_: EventType::Warning,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&ev, reference).await {
            warn!(error = %e, reason, "failed to publish event");
        }
    }
}

/// Adds a finalizer through a merge patch if it is not already present.
pub async fn ensure_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
{
    if obj.finalizers().iter().any(|f| f == finalizer) {
        return Ok(());
    }
    let mut finalizers: Vec<String> = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    let patch = json!({"metadata": {"finalizers": finalizers}});
    api.patch(
        &obj.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Drops a finalizer; a no-op when it is absent.
pub async fn remove_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
{
    if !obj.finalizers().iter().any(|f| f == finalizer) {
        return Ok(());
    }
    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect();
    let patch = json!({"metadata": {"finalizers": finalizers}});
    api.patch(
        &obj.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Spawns the four hierarchy-side controllers. Each runs until the process
/// receives a shutdown signal.
pub async fn run(ctx: Arc<Context>) {
    // RBAC propagation must not wait for a `config` object to appear, and
    // a Discovery hiccup at startup must not turn it off for good.
    tokio::spawn(config::run_bootstrap(ctx.clone()));
    tokio::spawn(ctx.propagator.clone().run_dispatcher());

    let namespace_controller = hierarchy::namespace_controller(ctx.clone());
    let hierarchy_controller = hierarchy::hierarchy_controller(ctx.clone());
    let anchor_controller = anchor::controller(ctx.clone());
    let config_controller = config::controller(ctx.clone());

    info!("starting hierarchy controllers");
    tokio::join!(
        namespace_controller.for_each(drain),
        hierarchy_controller.for_each(drain),
        anchor_controller.for_each(drain),
        config_controller.for_each(drain),
    );
}

async fn drain<O: Debug, E: std::fmt::Display>(res: Result<O, E>) {
    if let Err(e) = res {
        info!("controller stream error: {e}");
    }
}
