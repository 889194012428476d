//! Object propagator: copies selected kinds from ancestor namespaces into
//! descendants, enforcing source-of-truth semantics, exception annotations,
//! and halt suspension.
//!
//! One worker task runs per kind in `Propagate` mode, driven by a dynamic
//! watch; a dispatcher task resyncs namespaces the hierarchy reconcilers
//! flag as changed.

use futures::StreamExt;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::core::ApiResource;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Client, Resource, ResourceExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::api::v1alpha2::{Condition, SyncMode};
use crate::api::{
    ANNOTATION_INHERITED_FROM, ANNOTATION_MANAGED_BY, ANNOTATION_NONE, ANNOTATION_SELECT,
    ANNOTATION_TREE_SELECT, CONDITION_ACTIVITIES_HALTED, EVENT_CANNOT_PROPAGATE,
    EVENT_CANNOT_UPDATE, MANAGED_BY_VALUE, TypeKey,
};
use crate::errors::Result;
use crate::forest::Forest;

struct KindEntry {
    mode: SyncMode,
    ar: ApiResource,
    stop: watch::Sender<bool>,
    propagated: Arc<AtomicU64>,
}

struct Shared {
    client: Client,
    forest: Arc<Mutex<Forest>>,
    recorder: Recorder,
    kinds: Mutex<HashMap<TypeKey, KindEntry>>,
}

/// Handle shared by the reconcilers; cheap to clone.
#[derive(Clone)]
pub struct Propagator {
    shared: Arc<Shared>,
    request_tx: mpsc::UnboundedSender<Vec<String>>,
    request_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<Vec<String>>>>>,
}

impl Propagator {
    pub fn new(client: Client, forest: Arc<Mutex<Forest>>) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let reporter = Reporter {
            controller: "canopy-propagator".into(),
            instance: None,
        };
        Self {
            shared: Arc::new(Shared {
                recorder: Recorder::new(client.clone(), reporter),
                client,
                forest,
                kinds: Mutex::new(HashMap::new()),
            }),
            request_tx,
            request_rx: Arc::new(Mutex::new(Some(request_rx))),
        }
    }

    /// Asks the propagator to re-converge the given namespaces for every
    /// active kind. Called from the hierarchy reconcilers on any structural
    /// change.
    pub fn request(&self, namespaces: Vec<String>) {
        if namespaces.is_empty() {
            return;
        }
        let _ = self.request_tx.send(namespaces);
    }

    /// Whether any kind-to-mode table has been applied yet. Used to keep
    /// the startup bootstrap from clobbering a configuration the config
    /// reconciler already installed.
    pub fn is_configured(&self) -> bool {
        !self.shared.kinds.lock().unwrap().is_empty()
    }

    pub fn counts(&self, key: &TypeKey) -> (u64, u64) {
        let sources = self.shared.forest.lock().unwrap().local_source_count(key);
        let propagated = self
            .shared
            .kinds
            .lock()
            .unwrap()
            .get(key)
            .map(|e| e.propagated.load(Ordering::Relaxed))
            .unwrap_or(0);
        (sources, propagated)
    }

    /// Applies a resolved kind-to-mode table: starts watch workers for new
    /// `Propagate` kinds, runs removal sweeps for `Remove`, and stops
    /// workers for kinds that left the table or went back to `Ignore`.
    pub fn apply_modes(&self, table: Vec<(TypeKey, ApiResource, SyncMode)>) {
        let mut kinds = self.shared.kinds.lock().unwrap();

        let desired: HashMap<TypeKey, SyncMode> = table
            .iter()
            .map(|(k, _, m)| (k.clone(), *m))
            .collect();
        kinds.retain(|key, entry| {
            let keep = desired.get(key) == Some(&entry.mode);
            if !keep {
                let _ = entry.stop.send(true);
            }
            keep
        });

        for (key, ar, mode) in table {
            if kinds.contains_key(&key) || mode == SyncMode::Ignore {
                continue;
            }
            let (stop_tx, stop_rx) = watch::channel(false);
            let propagated = Arc::new(AtomicU64::new(0));
            let sync = KindSync {
                shared: self.shared.clone(),
                key: key.clone(),
                ar: ar.clone(),
                propagated: propagated.clone(),
            };
            match mode {
                SyncMode::Propagate => {
                    info!(kind = %key, "starting propagation worker");
                    tokio::spawn(sync.run_watch(stop_rx));
                }
                SyncMode::Remove => {
                    info!(kind = %key, "clearing propagated copies");
                    tokio::spawn(sync.run_remove());
                }
                SyncMode::Ignore => unreachable!(),
            }
            kinds.insert(
                key,
                KindEntry {
                    mode,
                    ar,
                    stop: stop_tx,
                    propagated,
                },
            );
        }
    }

    /// Consumes hierarchy-change requests forever. Spawned once at startup.
    pub async fn run_dispatcher(self) {
        let Some(mut rx) = self.request_rx.lock().unwrap().take() else {
            warn!("propagator dispatcher started twice");
            return;
        };
        while let Some(namespaces) = rx.recv().await {
            let syncs: Vec<KindSync> = {
                let kinds = self.shared.kinds.lock().unwrap();
                kinds
                    .iter()
                    .filter(|(_, e)| e.mode == SyncMode::Propagate)
                    .map(|(k, e)| KindSync {
                        shared: self.shared.clone(),
                        key: k.clone(),
                        ar: e.ar.clone(),
                        propagated: e.propagated.clone(),
                    })
                    .collect()
            };
            for sync in syncs {
                for ns in &namespaces {
                    if let Err(e) = sync.resync_namespace(ns).await {
                        warn!(kind = %sync.key, namespace = %ns, error = %e, "resync failed");
                    }
                }
            }
        }
    }
}

/// Per-kind propagation engine. All store I/O happens outside the forest
/// lock: decisions are computed on snapshots and re-checked on retry.
struct KindSync {
    shared: Arc<Shared>,
    key: TypeKey,
    ar: ApiResource,
    propagated: Arc<AtomicU64>,
}

impl KindSync {
    fn all_api(&self) -> Api<DynamicObject> {
        Api::all_with(self.shared.client.clone(), &self.ar)
    }

    fn ns_api(&self, ns: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.shared.client.clone(), ns, &self.ar)
    }

    async fn run_watch(self, mut stop: watch::Receiver<bool>) {
        let stream = watcher::watcher(self.all_api(), watcher::Config::default()).default_backoff();
        let mut stream = Box::pin(stream);
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    info!(kind = %self.key, "propagation worker stopping");
                    return;
                }
                event = stream.next() => {
                    match event {
                        Some(Ok(watcher::Event::Apply(obj)))
                        | Some(Ok(watcher::Event::InitApply(obj))) => {
                            if let Err(e) = self.handle_apply(obj).await {
                                warn!(kind = %self.key, error = %e, "propagation apply failed");
                            }
                        }
                        Some(Ok(watcher::Event::Delete(obj))) => {
                            if let Err(e) = self.handle_delete(obj).await {
                                warn!(kind = %self.key, error = %e, "propagation delete failed");
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(kind = %self.key, error = %e, "watch error, backing off");
                        }
                        None => return,
                    }
                }
            }
        }
    }

    /// Mode `Remove`: delete every propagated copy of this kind, leave
    /// sources untouched.
    async fn run_remove(self) {
        let namespaces = self.shared.forest.lock().unwrap().namespaces();
        for ns in namespaces {
            let api = self.ns_api(&ns);
            let list = match api.list(&ListParams::default()).await {
                Ok(l) => l,
                Err(e) => {
                    warn!(kind = %self.key, namespace = %ns, error = %e, "list failed during removal");
                    continue;
                }
            };
            for obj in list.items {
                if !is_copy(&obj) {
                    continue;
                }
                let name = obj.name_any();
                match api.delete(&name, &DeleteParams::default()).await {
                    Ok(_) => info!(kind = %self.key, namespace = %ns, name = %name, "removed propagated copy"),
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                    Err(e) => warn!(kind = %self.key, namespace = %ns, name = %name, error = %e, "removal failed"),
                }
            }
        }
    }

    async fn handle_apply(&self, obj: DynamicObject) -> Result<()> {
        let Some(ns) = obj.namespace() else {
            return Ok(());
        };
        let name = obj.name_any();
        if is_copy(&obj) {
            // A copy changed (or was just written). Converge its namespace.
            return self.resync_one(&ns, &name).await;
        }
        {
            let mut forest = self.shared.forest.lock().unwrap();
            forest.register_local_source(&ns, &self.key, &name);
        }
        self.propagate_from(&ns, &name, &obj).await
    }

    async fn handle_delete(&self, obj: DynamicObject) -> Result<()> {
        let Some(ns) = obj.namespace() else {
            return Ok(());
        };
        let name = obj.name_any();
        if is_copy(&obj) {
            // A user deleted a copy out from under us; re-converge.
            return self.resync_one(&ns, &name).await;
        }
        let descendants = {
            let mut forest = self.shared.forest.lock().unwrap();
            forest.unregister_local_source(&ns, &self.key, &name);
            forest.descendants(&ns)
        };
        for d in descendants {
            self.resync_one(&d, &name).await?;
        }
        Ok(())
    }

    /// Propagates one source object into every eligible descendant, and
    /// removes copies from descendants that fell out of the target set.
    async fn propagate_from(&self, src_ns: &str, name: &str, src: &DynamicObject) -> Result<()> {
        let exceptions = Exceptions::parse(src.annotations());
        let (targets, cleanup) = {
            let forest = self.shared.forest.lock().unwrap();
            if forest.is_halted(src_ns) {
                // Propagation out of a halted namespace is suspended.
                return Ok(());
            }
            let mut targets = Vec::new();
            let mut cleanup = Vec::new();
            for d in forest.descendants(src_ns) {
                if forest.is_halted(&d) {
                    continue;
                }
                let authoritative =
                    forest.propagation_source_for(&d, &self.key, name).as_deref() == Some(src_ns);
                if authoritative && exceptions.allows(&forest, &d) {
                    targets.push(d);
                } else {
                    cleanup.push(d);
                }
            }
            (targets, cleanup)
        };

        for d in targets {
            self.write_copy(src_ns, &d, name, src).await?;
        }
        for d in cleanup {
            self.delete_copy_if_from(&d, name, Some(src_ns)).await?;
        }
        Ok(())
    }

    /// Converges a single (namespace, name) slot: ensures the copy from the
    /// authoritative ancestor exists, or removes a stray one.
    async fn resync_one(&self, ns: &str, name: &str) -> Result<()> {
        let (halted, src_ns) = {
            let forest = self.shared.forest.lock().unwrap();
            (
                forest.is_halted(ns),
                forest.propagation_source_for(ns, &self.key, name),
            )
        };
        if halted {
            // Halted namespaces retain whatever is there.
            return Ok(());
        }
        let Some(src_ns) = src_ns else {
            return self.delete_copy_if_from(ns, name, None).await;
        };
        let src_api = self.ns_api(&src_ns);
        match src_api.get_opt(name).await? {
            Some(src) if !is_copy(&src) => {
                let allowed = {
                    let forest = self.shared.forest.lock().unwrap();
                    Exceptions::parse(src.annotations()).allows(&forest, ns)
                };
                if allowed {
                    self.write_copy(&src_ns, ns, name, &src).await
                } else {
                    self.delete_copy_if_from(ns, name, Some(&src_ns)).await
                }
            }
            _ => self.delete_copy_if_from(ns, name, None).await,
        }
    }

    /// Re-converges every slot that could affect one namespace: copies it
    /// should have from ancestors, and copies it has that lost their source.
    async fn resync_namespace(&self, ns: &str) -> Result<()> {
        let (halted, wanted) = {
            let forest = self.shared.forest.lock().unwrap();
            let mut wanted: Vec<String> = Vec::new();
            for a in forest.ancestry(ns) {
                if a == ns {
                    continue;
                }
                for name in forest.local_source_names(&a, &self.key) {
                    if !wanted.contains(&name) {
                        wanted.push(name);
                    }
                }
            }
            (forest.is_halted(ns), wanted)
        };
        if halted {
            return Ok(());
        }
        for name in &wanted {
            self.resync_one(ns, name).await?;
        }
        // Stray copies whose source is gone entirely.
        let api = self.ns_api(ns);
        let list = api.list(&ListParams::default()).await?;
        for obj in list.items {
            let name = obj.name_any();
            if is_copy(&obj) && !wanted.contains(&name) {
                self.delete_copy_if_from(ns, &name, None).await?;
            }
        }
        Ok(())
    }

    async fn write_copy(
        &self,
        src_ns: &str,
        dest_ns: &str,
        name: &str,
        src: &DynamicObject,
    ) -> Result<()> {
        let api = self.ns_api(dest_ns);
        let desired = build_copy(src, src_ns, dest_ns);

        let outcome = match api.get_opt(name).await? {
            None => match api.create(&PostParams::default(), &desired).await {
                Ok(_) => {
                    self.propagated.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Some(existing) => {
                if !is_managed(&existing) {
                    // Pre-existing user object in the destination; never
                    // overwrite it silently.
                    self.report_write_failure(
                        src_ns,
                        dest_ns,
                        src,
                        &format!("destination object \"{dest_ns}/{name}\" is not managed by canopy"),
                    )
                    .await;
                    return Ok(());
                }
                if copies_equal(&existing, &desired) {
                    return Ok(());
                }
                let mut updated = desired.clone();
                updated.metadata.resource_version = existing.resource_version();
                api.replace(name, &PostParams::default(), &updated)
                    .await
                    .map(|_| ())
            }
        };

        match outcome {
            Ok(()) => {
                let mut forest = self.shared.forest.lock().unwrap();
                forest.clear_extra_conditions(src_ns, EVENT_CANNOT_PROPAGATE);
                forest.clear_extra_conditions(dest_ns, EVENT_CANNOT_UPDATE);
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 403 => {
                self.report_write_failure(src_ns, dest_ns, src, &ae.message)
                    .await;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Records the conditions and events for a copy that could not be
    /// written.
    async fn report_write_failure(
        &self,
        src_ns: &str,
        dest_ns: &str,
        src: &DynamicObject,
        detail: &str,
    ) {
        warn!(
            kind = %self.key,
            source = %src_ns,
            destination = %dest_ns,
            detail,
            "could not propagate object"
        );
        {
            let mut forest = self.shared.forest.lock().unwrap();
            forest.set_extra_condition(
                src_ns,
                Condition::new(
                    CONDITION_ACTIVITIES_HALTED,
                    EVENT_CANNOT_PROPAGATE,
                    format!("Could not write to destination namespace \"{dest_ns}\""),
                ),
            );
            forest.set_extra_condition(
                dest_ns,
                Condition::new(
                    CONDITION_ACTIVITIES_HALTED,
                    EVENT_CANNOT_UPDATE,
                    format!("Could not write from source namespace \"{src_ns}\""),
                ),
            );
        }
        let reference: ObjectReference = src.object_ref(&self.ar);
        self.publish(
            &reference,
            EVENT_CANNOT_PROPAGATE,
            format!("Could not write to destination namespace \"{dest_ns}\""),
        )
        .await;
        self.publish(
            &reference,
            EVENT_CANNOT_UPDATE,
            format!("Could not write from source namespace \"{src_ns}\""),
        )
        .await;
    }

    async fn publish(&self, reference: &ObjectReference, reason: &str, note: String) {
        let ev = Event {
            type_: EventType::Warning,
            reason: reason.to_string(),
            note: Some(note),
            action: "Propagate".to_string(),
            secondary: None,
        };
        if let Err(e) = self.shared.recorder.publish(&ev, reference).await {
            warn!(error = %e, "failed to publish propagation event");
        }
    }

    /// Deletes the copy of `name` in `ns` when it is a managed copy (and,
    /// when `from` is given, only when it was inherited from there).
    async fn delete_copy_if_from(&self, ns: &str, name: &str, from: Option<&str>) -> Result<()> {
        let api = self.ns_api(ns);
        let Some(existing) = api.get_opt(name).await? else {
            return Ok(());
        };
        if !is_copy(&existing) || !is_managed(&existing) {
            return Ok(());
        }
        if let Some(from) = from {
            if inherited_from(&existing).as_deref() != Some(from) {
                return Ok(());
            }
        }
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                self.propagated.fetch_sub(1, Ordering::Relaxed);
                debug!(kind = %self.key, namespace = %ns, name = %name, "deleted propagated copy");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub fn inherited_from(obj: &DynamicObject) -> Option<String> {
    obj.annotations().get(ANNOTATION_INHERITED_FROM).cloned()
}

pub fn is_copy(obj: &DynamicObject) -> bool {
    obj.annotations().contains_key(ANNOTATION_INHERITED_FROM)
}

pub fn is_managed(obj: &DynamicObject) -> bool {
    obj.annotations().get(ANNOTATION_MANAGED_BY).map(String::as_str) == Some(MANAGED_BY_VALUE)
}

/// Builds the descendant copy of a source object: same payload, fresh
/// identity, provenance annotations attached, exception annotations
/// stripped.
pub fn build_copy(src: &DynamicObject, src_ns: &str, dest_ns: &str) -> DynamicObject {
    let mut copy = src.clone();
    copy.metadata.namespace = Some(dest_ns.to_string());
    copy.metadata.uid = None;
    copy.metadata.resource_version = None;
    copy.metadata.creation_timestamp = None;
    copy.metadata.generation = None;
    copy.metadata.owner_references = None;
    copy.metadata.managed_fields = None;
    let mut annotations = copy.metadata.annotations.take().unwrap_or_default();
    annotations.remove(ANNOTATION_TREE_SELECT);
    annotations.remove(ANNOTATION_SELECT);
    annotations.remove(ANNOTATION_NONE);
    annotations.insert(ANNOTATION_INHERITED_FROM.to_string(), src_ns.to_string());
    annotations.insert(ANNOTATION_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
    copy.metadata.annotations = Some(annotations);
    if let Some(map) = copy.data.as_object_mut() {
        map.remove("status");
    }
    copy
}

/// Payload equality for copies: identical data, labels, and provenance.
pub fn copies_equal(existing: &DynamicObject, desired: &DynamicObject) -> bool {
    existing.data == desired.data
        && existing.metadata.labels == desired.metadata.labels
        && existing.metadata.annotations == desired.metadata.annotations
}

/// Parsed propagation exceptions from a source object's annotations.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Exceptions {
    pub none: bool,
    pub tree_positive: Vec<String>,
    pub tree_negative: Vec<String>,
    pub selector: Option<String>,
}

impl Exceptions {
    pub fn parse(annotations: &BTreeMap<String, String>) -> Self {
        let mut ex = Self::default();
        if let Some(v) = annotations.get(ANNOTATION_NONE) {
            ex.none = v != "false";
        }
        if let Some(v) = annotations.get(ANNOTATION_TREE_SELECT) {
            for entry in v.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                if let Some(excluded) = entry.strip_prefix('!') {
                    ex.tree_negative.push(excluded.to_string());
                } else {
                    ex.tree_positive.push(entry.to_string());
                }
            }
        }
        if let Some(v) = annotations.get(ANNOTATION_SELECT) {
            ex.selector = Some(v.clone());
        }
        ex
    }

    /// Whether propagation into `dest` is permitted.
    pub fn allows(&self, forest: &Forest, dest: &str) -> bool {
        if self.none {
            return false;
        }
        let ancestry = forest.ancestry(dest);
        if self
            .tree_negative
            .iter()
            .any(|x| ancestry.iter().any(|a| a == x))
        {
            return false;
        }
        if !self.tree_positive.is_empty()
            && !self
                .tree_positive
                .iter()
                .any(|x| ancestry.iter().any(|a| a == x))
        {
            return false;
        }
        if let Some(selector) = &self.selector {
            return match_label_selector(selector, &forest.labels(dest));
        }
        true
    }
}

/// Matches a simple label selector of comma-separated terms: `k=v`, `k==v`,
/// `k!=v`, `k`, `!k`.
pub fn match_label_selector(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .all(|term| {
            if let Some((k, v)) = term.split_once("!=") {
                return labels.get(k.trim()).map(String::as_str) != Some(v.trim());
            }
            if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
                return labels.get(k.trim()).map(String::as_str) == Some(v.trim());
            }
            if let Some(k) = term.strip_prefix('!') {
                return !labels.contains_key(k.trim());
            }
            labels.contains_key(term)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::Forest;

    fn forest() -> Forest {
        let mut f = Forest::new();
        for (ns, parent) in [
            ("root", None),
            ("team-a", Some("root")),
            ("team-b", Some("root")),
            ("svc-1", Some("team-a")),
        ] {
            f.observe(ns);
            f.set_parent(ns, parent).unwrap();
        }
        f
    }

    fn ann(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn none_annotation_blocks_everything() {
        let ex = Exceptions::parse(&ann(&[(ANNOTATION_NONE, "true")]));
        assert!(!ex.allows(&forest(), "team-a"));
        let ex = Exceptions::parse(&ann(&[(ANNOTATION_NONE, "false")]));
        assert!(ex.allows(&forest(), "team-a"));
    }

    #[test]
    fn tree_select_restricts_and_excludes() {
        let f = forest();
        // Restrict to team-a's subtree.
        let ex = Exceptions::parse(&ann(&[(ANNOTATION_TREE_SELECT, "team-a")]));
        assert!(ex.allows(&f, "team-a"));
        assert!(ex.allows(&f, "svc-1"));
        assert!(!ex.allows(&f, "team-b"));
        // Exclude team-a's subtree.
        let ex = Exceptions::parse(&ann(&[(ANNOTATION_TREE_SELECT, "!team-a")]));
        assert!(!ex.allows(&f, "team-a"));
        assert!(!ex.allows(&f, "svc-1"));
        assert!(ex.allows(&f, "team-b"));
        // Mixed: inside team-a but not svc-1.
        let ex = Exceptions::parse(&ann(&[(ANNOTATION_TREE_SELECT, "team-a, !svc-1")]));
        assert!(ex.allows(&f, "team-a"));
        assert!(!ex.allows(&f, "svc-1"));
    }

    #[test]
    fn select_matches_namespace_labels() {
        let mut f = forest();
        f.set_labels("team-a", ann(&[("env", "prod")]));
        f.set_labels("team-b", ann(&[("env", "dev")]));
        let ex = Exceptions::parse(&ann(&[(ANNOTATION_SELECT, "env=prod")]));
        assert!(ex.allows(&f, "team-a"));
        assert!(!ex.allows(&f, "team-b"));
    }

    #[test]
    fn selector_terms() {
        let labels = ann(&[("env", "prod"), ("team", "a")]);
        assert!(match_label_selector("env=prod", &labels));
        assert!(match_label_selector("env==prod,team=a", &labels));
        assert!(match_label_selector("env!=dev", &labels));
        assert!(match_label_selector("env", &labels));
        assert!(match_label_selector("!missing", &labels));
        assert!(!match_label_selector("env=dev", &labels));
        assert!(!match_label_selector("missing", &labels));
    }

    #[test]
    fn build_copy_sets_provenance_and_strips_identity() {
        let mut src = DynamicObject {
            types: None,
            metadata: Default::default(),
            data: serde_json::json!({"data": {"k": "v"}, "status": {"x": 1}}),
        };
        src.metadata.name = Some("creds".to_string());
        src.metadata.namespace = Some("root".to_string());
        src.metadata.uid = Some("u-1".to_string());
        src.metadata.resource_version = Some("42".to_string());
        src.metadata.annotations = Some(ann(&[(ANNOTATION_TREE_SELECT, "team-a")]));

        let copy = build_copy(&src, "root", "team-a");
        assert_eq!(copy.metadata.namespace.as_deref(), Some("team-a"));
        assert!(copy.metadata.uid.is_none());
        assert!(copy.metadata.resource_version.is_none());
        let annotations = copy.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations.get(ANNOTATION_INHERITED_FROM).unwrap(), "root");
        assert_eq!(annotations.get(ANNOTATION_MANAGED_BY).unwrap(), MANAGED_BY_VALUE);
        assert!(!annotations.contains_key(ANNOTATION_TREE_SELECT));
        assert!(copy.data.get("status").is_none());
        assert!(is_copy(&copy));
        assert!(is_managed(&copy));
        assert!(copies_equal(&copy, &build_copy(&src, "root", "team-a")));
    }
}
