//! Virtual-node lifecycle: a node exists in a tenant view only while at
//! least one tenant pod is bound to the matching super node. When the last
//! pod goes, the node quiesces, and after the grace period the tenant-side
//! node object is collected.

use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, DeleteParams};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::errors::{Error, Result};
use crate::syncer::cluster::ClusterRegistry;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum GcPhase {
    Quiescing,
    Deleting,
}

#[derive(Debug)]
struct Record {
    pods: HashSet<String>,
    phase: Option<(GcPhase, Instant)>,
}

/// Per-(cluster, node) pod reference counts and GC phases, behind one
/// mutex with the same snapshot-then-I/O discipline as the forest.
#[derive(Default)]
pub struct VNodeTracker {
    inner: Mutex<HashMap<(String, String), Record>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct VNodeSummary {
    pub cluster: String,
    pub node: String,
    pub pods: usize,
    pub phase: Option<GcPhase>,
}

impl VNodeTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claims a node for a pod bind. Cancels a pending quiesce atomically;
    /// a node already being deleted cannot be claimed and the caller must
    /// requeue.
    pub fn acquire_for_bind(&self, cluster: &str, node: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .entry((cluster.to_string(), node.to_string()))
            .or_insert_with(|| Record {
                pods: HashSet::new(),
                phase: None,
            });
        match record.phase {
            Some((GcPhase::Deleting, _)) => Err(Error::VirtualNodeDeleting(node.to_string())),
            _ => {
                record.phase = None;
                Ok(())
            }
        }
    }

    pub fn track_pod(&self, cluster: &str, node: &str, pod_uid: &str) {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .entry((cluster.to_string(), node.to_string()))
            .or_insert_with(|| Record {
                pods: HashSet::new(),
                phase: None,
            });
        record.pods.insert(pod_uid.to_string());
        record.phase = None;
    }

    pub fn untrack_pod(&self, cluster: &str, node: &str, pod_uid: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.get_mut(&(cluster.to_string(), node.to_string())) {
            record.pods.remove(pod_uid);
            if record.pods.is_empty() && record.phase.is_none() {
                record.phase = Some((GcPhase::Quiescing, Instant::now()));
            }
        }
    }

    /// Moves quiescing nodes past the grace period into `Deleting` and
    /// returns them for collection.
    pub fn sweep(&self, grace: Duration) -> Vec<(String, String)> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let mut due = Vec::new();
        for ((cluster, node), record) in inner.iter_mut() {
            if let Some((GcPhase::Quiescing, since)) = record.phase {
                if now.duration_since(since) >= grace {
                    record.phase = Some((GcPhase::Deleting, since));
                    due.push((cluster.clone(), node.clone()));
                }
            }
        }
        due
    }

    /// Forgets a node once its tenant-side object is gone.
    pub fn forget(&self, cluster: &str, node: &str) {
        self.inner
            .lock()
            .unwrap()
            .remove(&(cluster.to_string(), node.to_string()));
    }

    pub fn phase(&self, cluster: &str, node: &str) -> Option<GcPhase> {
        self.inner
            .lock()
            .unwrap()
            .get(&(cluster.to_string(), node.to_string()))
            .and_then(|r| r.phase.map(|(p, _)| p))
    }

    pub fn summaries(&self) -> Vec<VNodeSummary> {
        let inner = self.inner.lock().unwrap();
        let mut sorted: BTreeMap<(String, String), VNodeSummary> = BTreeMap::new();
        for ((cluster, node), record) in inner.iter() {
            sorted.insert(
                (cluster.clone(), node.clone()),
                VNodeSummary {
                    cluster: cluster.clone(),
                    node: node.clone(),
                    pods: record.pods.len(),
                    phase: record.phase.map(|(p, _)| p),
                },
            );
        }
        sorted.into_values().collect()
    }
}

/// Periodic collection of quiesced virtual nodes from the tenant views.
pub async fn run_gc(
    tracker: Arc<VNodeTracker>,
    registry: Arc<ClusterRegistry>,
    grace: Duration,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        for (cluster_name, node_name) in tracker.sweep(grace) {
            let cluster = match registry.get(&cluster_name) {
                Ok(c) => c,
                Err(_) => {
                    tracker.forget(&cluster_name, &node_name);
                    continue;
                }
            };
            let nodes: Api<Node> = Api::all(cluster.client.clone());
            match nodes.delete(&node_name, &DeleteParams::default()).await {
                Ok(_) => {
                    info!(cluster = %cluster_name, node = %node_name, "collected virtual node");
                    tracker.forget(&cluster_name, &node_name);
                }
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    tracker.forget(&cluster_name, &node_name);
                }
                Err(e) => {
                    warn!(cluster = %cluster_name, node = %node_name, error = %e, "virtual node delete failed");
                    // Leave it in Deleting; the next sweep will not return
                    // it, so retry by resetting to quiescing at epoch.
                    tracker.requeue_delete(&cluster_name, &node_name);
                }
            }
        }
    }
}

impl VNodeTracker {
    /// Re-arms a failed deletion so the next sweep retries it.
    fn requeue_delete(&self, cluster: &str, node: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.get_mut(&(cluster.to_string(), node.to_string())) {
            if let Some((GcPhase::Deleting, since)) = record.phase {
                record.phase = Some((GcPhase::Quiescing, since));
            }
        }
    }
}
