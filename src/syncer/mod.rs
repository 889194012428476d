//! The virtual-cluster syncer: projects tenant objects into the super
//! cluster (downward sync), back-populates runtime state (upward sync), and
//! patrols for drift. The skeleton here is generic; each supported kind
//! supplies a vtable record through [`SyncedKind`].

pub mod cluster;
pub mod conversion;
pub mod equality;
pub mod mc;
pub mod patrol;
pub mod queue;
pub mod resources;
pub mod vnode;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams, Preconditions};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ProjectionConfig;
use crate::errors::{Error, Result};
use crate::syncer::cluster::{ClusterClient, ClusterRegistry};
use crate::syncer::conversion::{
    ANNOTATION_CLUSTER, ANNOTATION_NAMESPACE, is_owned_by_syncer, owner_cluster, owner_namespace,
    super_uid, to_super,
};
use crate::syncer::patrol::Gauges;
use crate::syncer::queue::{Outcome, SyncKey, WorkQueue};
use crate::syncer::vnode::VNodeTracker;

/// Shared dependencies handed to every kind hook.
#[derive(Clone)]
pub struct SyncCtx {
    pub registry: Arc<ClusterRegistry>,
    pub super_client: Client,
    pub projection: ProjectionConfig,
    pub vnodes: Arc<VNodeTracker>,
    pub gauges: Arc<Gauges>,
}

/// Outcome of the pre-create hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreCreate {
    Proceed,
    /// The tenant object is not projectable; an event has been emitted and
    /// the key is finished.
    Skip,
}

/// Outcome of the orphan hook during patrol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Orphan {
    Delete,
    /// Adopted or deferred; do not delete this round.
    Keep,
}

/// The vtable one synced kind supplies over the shared skeleton.
#[async_trait]
pub trait SyncedKind: Send + Sync + 'static {
    type Obj: kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static;

    fn kind(&self) -> &'static str;

    /// Builds the super object for a tenant object (downward create). Async
    /// because some kinds resolve cross-store references (a pod's token
    /// secret) while building.
    async fn build_super(
        &self,
        ctx: &SyncCtx,
        cluster: &Arc<ClusterClient>,
        v: &Self::Obj,
        target_ns: &str,
    ) -> Result<Self::Obj>;

    /// Returns the updated super object when the tenant view drifted;
    /// `None` when they agree. Pure: no store access, so patrol can run it
    /// over full listings. The result must preserve the super object's
    /// identity fields so it can be written back directly.
    fn check_equality(
        &self,
        cfg: &ProjectionConfig,
        p: &Self::Obj,
        v: &Self::Obj,
    ) -> Option<Self::Obj>;

    /// Readiness and admission checks before a downward create.
    async fn pre_create(
        &self,
        _ctx: &SyncCtx,
        _cluster: &Arc<ClusterClient>,
        _v: &Self::Obj,
        _target_ns: &str,
    ) -> Result<PreCreate> {
        Ok(PreCreate::Proceed)
    }

    /// Locates the super peer. Defaults to by-name lookup; kinds with
    /// minted names (SA-token secrets) override with an index lookup.
    async fn find_super(
        &self,
        _ctx: &SyncCtx,
        api: &Api<Self::Obj>,
        _v: Option<&Self::Obj>,
        name: &str,
    ) -> Result<Option<Self::Obj>> {
        Ok(api.get_opt(name).await?)
    }

    /// Upward sync: push runtime state from the super object into the
    /// tenant view.
    async fn back_populate(
        &self,
        _ctx: &SyncCtx,
        _cluster: &Arc<ClusterClient>,
        _key: &SyncKey,
        _v: &Self::Obj,
        _p: &Self::Obj,
    ) -> Result<()> {
        Ok(())
    }

    /// Attempts adoption of a super object whose UID annotation is empty.
    /// Returns true when the object was claimed and the key is converged.
    async fn try_adopt(
        &self,
        _ctx: &SyncCtx,
        _cluster: &Arc<ClusterClient>,
        _v: &Self::Obj,
        _p: &Self::Obj,
    ) -> Result<bool> {
        Ok(false)
    }

    /// Called before a super object is deleted on behalf of a vanished
    /// tenant object.
    async fn pre_delete_super(&self, _ctx: &SyncCtx, _key: &SyncKey, _p: &Self::Obj) -> Result<()> {
        Ok(())
    }

    /// Decides the fate of a super object with no tenant peer. Consulted by
    /// both the keyed reconcile path and patrol.
    async fn on_super_orphan(
        &self,
        _ctx: &SyncCtx,
        _cluster: &Arc<ClusterClient>,
        _key: &SyncKey,
        _p: &Self::Obj,
    ) -> Result<Orphan> {
        Ok(Orphan::Delete)
    }
}

/// One per supported kind: the queue, the vtable, and the shared context.
pub struct Syncer<R: SyncedKind> {
    pub kind: R,
    pub ctx: SyncCtx,
    pub queue: Arc<WorkQueue<SyncKey>>,
}

impl<R: SyncedKind> Syncer<R> {
    pub fn new(kind: R, ctx: SyncCtx) -> Arc<Self> {
        Arc::new(Self {
            kind,
            ctx,
            queue: WorkQueue::new(),
        })
    }

    fn tenant_api(&self, cluster: &ClusterClient, ns: &str) -> Api<R::Obj> {
        Api::namespaced(cluster.client.clone(), ns)
    }

    fn super_api(&self, target_ns: &str) -> Api<R::Obj> {
        Api::namespaced(self.ctx.super_client.clone(), target_ns)
    }

    /// One serialised pass over a (cluster, namespace, name) key: the
    /// downward case analysis followed by upward back-population.
    pub async fn reconcile(&self, key: &SyncKey) -> Result<()> {
        let cluster = self.ctx.registry.get(&key.cluster)?;
        let target_ns = to_super(&key.cluster, &key.namespace);
        let v_api = self.tenant_api(&cluster, &key.namespace);
        let p_api = self.super_api(&target_ns);

        let v = v_api.get_opt(&key.name).await?;
        let p = self
            .kind
            .find_super(&self.ctx, &p_api, v.as_ref(), &key.name)
            .await?;

        match (v, p) {
            (None, None) => Ok(()),
            (Some(v), None) => self.create_super(&cluster, &p_api, &v, &target_ns).await,
            (None, Some(p)) => self.delete_super(&cluster, key, &p_api, &p).await,
            (Some(v), Some(p)) => self.converge(&cluster, key, &v_api, &p_api, v, p).await,
        }
    }

    async fn create_super(
        &self,
        cluster: &Arc<ClusterClient>,
        p_api: &Api<R::Obj>,
        v: &R::Obj,
        target_ns: &str,
    ) -> Result<()> {
        // Never resurrect an object the tenant is already tearing down.
        if v.meta().deletion_timestamp.is_some() {
            return Ok(());
        }
        if self.kind.pre_create(&self.ctx, cluster, v, target_ns).await? == PreCreate::Skip {
            return Ok(());
        }

        ensure_super_namespace(&self.ctx.super_client, &cluster.name, &v_namespace(v), target_ns)
            .await?;

        let p = self.kind.build_super(&self.ctx, cluster, v, target_ns).await?;
        match p_api.create(&PostParams::default(), &p).await {
            Ok(_) => {
                debug!(kind = self.kind.kind(), namespace = %target_ns, name = %v.name_any(), "created super object");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                // Someone beat us to it; matching UID means success.
                let existing = p_api.get(&v.name_any()).await?;
                let expected = v.uid().unwrap_or_default();
                match super_uid(existing.meta()) {
                    Some(found) if found == expected => Ok(()),
                    found => Err(Error::DelegatedUidMismatch {
                        namespace: target_ns.to_string(),
                        name: v.name_any(),
                        expected,
                        found: found.unwrap_or_default(),
                    }),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_super(
        &self,
        cluster: &Arc<ClusterClient>,
        key: &SyncKey,
        p_api: &Api<R::Obj>,
        p: &R::Obj,
    ) -> Result<()> {
        let annotations = p.meta().annotations.clone().unwrap_or_default();
        if !is_owned_by_syncer(&annotations) {
            // Not ours; leave it untouched.
            return Ok(());
        }
        // The orphan hook decides here exactly as it does during patrol, so
        // an adoptable object awaiting its tenant peer survives the watch
        // path too.
        if self.kind.on_super_orphan(&self.ctx, cluster, key, p).await? == Orphan::Keep {
            return Ok(());
        }
        self.kind.pre_delete_super(&self.ctx, key, p).await?;
        delete_with_uid_precondition(p_api, &p.name_any(), p.uid()).await
    }

    async fn converge(
        &self,
        cluster: &Arc<ClusterClient>,
        key: &SyncKey,
        _v_api: &Api<R::Obj>,
        p_api: &Api<R::Obj>,
        v: R::Obj,
        p: R::Obj,
    ) -> Result<()> {
        let annotations = p.meta().annotations.clone().unwrap_or_default();
        if !is_owned_by_syncer(&annotations) {
            return Ok(());
        }

        let v_uid = v.uid().unwrap_or_default();
        let p = match super_uid(p.meta()) {
            None => {
                if self.kind.try_adopt(&self.ctx, cluster, &v, &p).await? {
                    // Re-read so the bound UID is visible downstream.
                    match p_api.get_opt(&p.name_any()).await? {
                        Some(p) => p,
                        None => return Ok(()),
                    }
                } else {
                    return Err(Error::DelegatedUidMismatch {
                        namespace: key.namespace.clone(),
                        name: key.name.clone(),
                        expected: v_uid,
                        found: String::new(),
                    });
                }
            }
            Some(found) if found != v_uid => {
                return Err(Error::DelegatedUidMismatch {
                    namespace: key.namespace.clone(),
                    name: key.name.clone(),
                    expected: v_uid,
                    found,
                });
            }
            Some(_) => p,
        };

        // Propagate the tenant's deletion grace; the super copy
        // follows the tenant out.
        if v.meta().deletion_timestamp.is_some() {
            let grace = v
                .meta()
                .deletion_grace_period_seconds
                .and_then(|g| u32::try_from(g).ok());
            self.kind.pre_delete_super(&self.ctx, key, &p).await?;
            let params = DeleteParams {
                grace_period_seconds: grace,
                preconditions: Some(Preconditions {
                    uid: p.uid(),
                    resource_version: None,
                }),
                ..Default::default()
            };
            match p_api.delete(&p.name_any(), &params).await {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 404 || ae.code == 409 => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(updated) = self.kind.check_equality(&self.ctx.projection, &p, &v) {
            debug!(kind = self.kind.kind(), name = %key.name, "tenant spec drifted, updating super object");
            p_api
                .replace(&p.name_any(), &PostParams::default(), &updated)
                .await?;
        }

        self.kind
            .back_populate(&self.ctx, cluster, key, &v, &p)
            .await
    }

    /// One full drift scan against one tenant cluster.
    pub async fn patrol_cluster(&self, cluster: &Arc<ClusterClient>) -> Result<()> {
        let v_list = Api::<R::Obj>::all(cluster.client.clone())
            .list(&Default::default())
            .await?;
        let p_list = Api::<R::Obj>::all(self.ctx.super_client.clone())
            .list(&Default::default())
            .await?;

        let mut v_index: BTreeMap<(String, String), R::Obj> = BTreeMap::new();
        let mut v_uids: BTreeSet<(String, String)> = BTreeSet::new();
        for v in v_list.items {
            let ns = v_namespace(&v);
            v_uids.insert((ns.clone(), v.uid().unwrap_or_default()));
            v_index.insert((ns, v.name_any()), v);
        }

        let mut mismatched = 0u64;
        let mut requeued = 0u64;
        let mut deleted_orphans = 0u64;

        let mut p_index: BTreeMap<(String, String), R::Obj> = BTreeMap::new();
        let mut p_uids: BTreeSet<(String, String)> = BTreeSet::new();
        for p in p_list.items {
            if owner_cluster(p.meta()).as_deref() != Some(cluster.name.as_str()) {
                continue;
            }
            let Some(tenant_ns) = owner_namespace(p.meta()) else {
                continue;
            };
            if let Some(uid) = super_uid(p.meta()) {
                p_uids.insert((tenant_ns.clone(), uid));
            }
            p_index.insert((tenant_ns, p.name_any()), p);
        }

        for ((ns, name), v) in &v_index {
            let key = SyncKey {
                cluster: cluster.name.clone(),
                namespace: ns.clone(),
                name: name.clone(),
            };
            match p_index.get(&(ns.clone(), name.clone())) {
                // OnAdd: tenant object missing its projection. Kinds with
                // minted super names (SA-token secrets) pair by UID instead.
                None => {
                    if p_uids.contains(&(ns.clone(), v.uid().unwrap_or_default())) {
                        continue;
                    }
                    self.queue.add(key);
                    requeued += 1;
                }
                // OnUpdate: UID check, then spec/status drift.
                Some(p) => {
                    let v_uid = v.uid().unwrap_or_default();
                    match super_uid(p.meta()) {
                        Some(found) if found != v_uid => {
                            let target_ns = to_super(&cluster.name, ns);
                            warn!(
                                kind = self.kind.kind(),
                                namespace = %ns,
                                name = %name,
                                "deleting super object with mismatched delegated UID"
                            );
                            delete_with_uid_precondition(
                                &self.super_api(&target_ns),
                                name,
                                p.uid(),
                            )
                            .await?;
                            deleted_orphans += 1;
                        }
                        // Unbound projection: the reconcile path decides
                        // between adoption and the mismatch condition.
                        None => {
                            self.queue.add(key);
                            mismatched += 1;
                        }
                        Some(_) => {
                            if self.kind.check_equality(&self.ctx.projection, p, v).is_some() {
                                self.queue.add(key);
                                mismatched += 1;
                            }
                        }
                    }
                }
            }
        }

        // OnDelete: projections whose tenant object is gone. A projection
        // whose UID still has a tenant peer (under a different name) is not
        // an orphan.
        for ((ns, name), p) in &p_index {
            if v_index.contains_key(&(ns.clone(), name.clone())) {
                continue;
            }
            if let Some(uid) = super_uid(p.meta()) {
                if v_uids.contains(&(ns.clone(), uid)) {
                    continue;
                }
            }
            let key = SyncKey {
                cluster: cluster.name.clone(),
                namespace: ns.clone(),
                name: name.clone(),
            };
            match self
                .kind
                .on_super_orphan(&self.ctx, cluster, &key, p)
                .await?
            {
                Orphan::Keep => {}
                Orphan::Delete => {
                    let target_ns = to_super(&cluster.name, ns);
                    self.kind.pre_delete_super(&self.ctx, &key, p).await?;
                    delete_with_uid_precondition(&self.super_api(&target_ns), name, p.uid())
                        .await?;
                    deleted_orphans += 1;
                }
            }
        }

        self.ctx
            .gauges
            .record(self.kind.kind(), mismatched, requeued, deleted_orphans);
        Ok(())
    }

    /// Queue worker: serialised reconciles with outcome-based requeue.
    pub async fn run_worker(self: Arc<Self>) {
        while let Some(key) = self.queue.next().await {
            let outcome = match self.reconcile(&key).await {
                Ok(()) => Outcome::Done,
                Err(e) if e.is_transient() => {
                    debug!(kind = self.kind.kind(), ?key, error = %e, "transient failure, will retry");
                    Outcome::Retry
                }
                Err(e) => {
                    warn!(kind = self.kind.kind(), ?key, error = %e, "permanent failure for key");
                    Outcome::Drop
                }
            };
            self.queue.done(key, outcome);
        }
    }
}

fn v_namespace<K: kube::Resource>(v: &K) -> String {
    v.meta().namespace.clone().unwrap_or_default()
}

/// Creates the super namespace backing a tenant namespace if it does not
/// exist yet, tagged with the owner annotations.
pub async fn ensure_super_namespace(
    super_client: &Client,
    cluster: &str,
    tenant_ns: &str,
    target_ns: &str,
) -> Result<()> {
    let api: Api<Namespace> = Api::all(super_client.clone());
    if api.get_opt(target_ns).await?.is_some() {
        return Ok(());
    }
    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_CLUSTER.to_string(), cluster.to_string());
    annotations.insert(ANNOTATION_NAMESPACE.to_string(), tenant_ns.to_string());
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(target_ns.to_string()),
            annotations: Some(annotations),
            ..Default::default()
        },
        ..Default::default()
    };
    info!(namespace = %target_ns, cluster = %cluster, "creating super namespace");
    match api.create(&PostParams::default(), &ns).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Deletes an object guarded by its UID so a racing recreation under the
/// same name is never collected by mistake.
pub async fn delete_with_uid_precondition<K>(
    api: &Api<K>,
    name: &str,
    uid: Option<String>,
) -> Result<()>
where
    K: kube::Resource<Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Debug,
    K::DynamicType: Default,
{
    let params = DeleteParams {
        preconditions: Some(Preconditions {
            uid,
            resource_version: None,
        }),
        ..Default::default()
    };
    match api.delete(name, &params).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 || ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}
