//! Multi-cluster watch fan-out: every registered tenant store gets a watch
//! per kind feeding the keyed queue, plus one super-store watch per kind
//! that maps owned objects back to their tenant keys.

use futures::StreamExt;
use kube::api::Api;
use kube::{Resource, ResourceExt};
use kube::runtime::{WatchStreamExt, watcher};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::syncer::cluster::{ClusterClient, ClusterListener};
use crate::syncer::conversion::{owner_cluster, owner_namespace};
use crate::syncer::queue::SyncKey;
use crate::syncer::{SyncCtx, SyncedKind, Syncer};

/// Number of concurrent reconcile workers per kind. Keys are still
/// serialised individually by the queue.
const WORKERS_PER_KIND: usize = 4;

/// Per-kind listener that spawns and stops tenant watches as clusters come
/// and go.
struct KindListener<R: SyncedKind> {
    syncer: Arc<Syncer<R>>,
    stops: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl<R: SyncedKind> ClusterListener for KindListener<R> {
    fn cluster_added(&self, cluster: &Arc<ClusterClient>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        self.stops
            .lock()
            .unwrap()
            .insert(cluster.name.clone(), stop_tx);
        let syncer = self.syncer.clone();
        let cluster = cluster.clone();
        tokio::spawn(async move {
            run_tenant_watch(syncer, cluster, stop_rx).await;
        });
    }

    fn cluster_removed(&self, name: &str) {
        if let Some(stop) = self.stops.lock().unwrap().remove(name) {
            let _ = stop.send(true);
        }
    }
}

/// Starts everything for one kind: the super watch, the tenant watch
/// listener, the worker pool, and the patrol loop.
pub fn start<R: SyncedKind>(kind: R, ctx: SyncCtx, patrol_period: std::time::Duration) {
    let syncer = Syncer::new(kind, ctx);

    for _ in 0..WORKERS_PER_KIND {
        tokio::spawn(syncer.clone().run_worker());
    }

    tokio::spawn(run_super_watch(syncer.clone()));
    tokio::spawn(crate::syncer::patrol::run(syncer.clone(), patrol_period));

    let listener = Arc::new(KindListener {
        syncer: syncer.clone(),
        stops: Mutex::new(HashMap::new()),
    });
    syncer.ctx.registry.subscribe(listener);
    info!(kind = syncer.kind.kind(), "syncer started");
}

/// Tenant-store watch: every touched object enqueues its key.
async fn run_tenant_watch<R: SyncedKind>(
    syncer: Arc<Syncer<R>>,
    cluster: Arc<ClusterClient>,
    mut stop: watch::Receiver<bool>,
) {
    let api = Api::<R::Obj>::all(cluster.client.clone());
    let stream = watcher::watcher(api, watcher::Config::default())
        .default_backoff()
        .touched_objects();
    let mut stream = Box::pin(stream);
    info!(kind = syncer.kind.kind(), cluster = %cluster.name, "tenant watch started");
    loop {
        tokio::select! {
            _ = stop.changed() => {
                info!(kind = syncer.kind.kind(), cluster = %cluster.name, "tenant watch stopped");
                return;
            }
            event = stream.next() => {
                match event {
                    Some(Ok(obj)) => {
                        let Some(namespace) = obj.meta().namespace.clone() else { continue };
                        syncer.queue.add(SyncKey {
                            cluster: cluster.name.clone(),
                            namespace,
                            name: obj.name_any(),
                        });
                    }
                    Some(Err(e)) => {
                        debug!(kind = syncer.kind.kind(), cluster = %cluster.name, error = %e, "tenant watch error");
                    }
                    None => {
                        warn!(kind = syncer.kind.kind(), cluster = %cluster.name, "tenant watch ended");
                        return;
                    }
                }
            }
        }
    }
}

/// Super-store watch: owned objects map back to their tenant keys through
/// the owner annotations; unowned objects are ignored.
async fn run_super_watch<R: SyncedKind>(syncer: Arc<Syncer<R>>) {
    let api = Api::<R::Obj>::all(syncer.ctx.super_client.clone());
    let stream = watcher::watcher(api, watcher::Config::default())
        .default_backoff()
        .touched_objects();
    let mut stream = Box::pin(stream);
    info!(kind = syncer.kind.kind(), "super watch started");
    while let Some(event) = stream.next().await {
        match event {
            Ok(obj) => {
                let Some(cluster) = owner_cluster(obj.meta()) else { continue };
                let Some(namespace) = owner_namespace(obj.meta()) else { continue };
                if syncer.ctx.registry.get(&cluster).is_err() {
                    continue;
                }
                syncer.queue.add(SyncKey {
                    cluster,
                    namespace,
                    name: obj.name_any(),
                });
            }
            Err(e) => {
                debug!(kind = syncer.kind.kind(), error = %e, "super watch error");
            }
        }
    }
    warn!(kind = syncer.kind.kind(), "super watch ended");
}
