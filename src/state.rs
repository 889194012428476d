//! Shared observable state served over the HTTP surface: the forest, the
//! patrol gauges, and the virtual-node map.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::forest::{Forest, NamespaceSummary};
use crate::syncer::patrol::{Gauges, KindGauges};
use crate::syncer::vnode::{VNodeSummary, VNodeTracker};

#[derive(Clone, Debug, Serialize)]
pub struct StateView {
    pub namespaces: Vec<NamespaceSummary>,
    pub patrol: BTreeMap<String, KindGauges>,
    pub virtual_nodes: Vec<VNodeSummary>,
}

#[derive(Clone)]
pub struct AppState {
    pub forest: Arc<Mutex<Forest>>,
    pub gauges: Arc<Gauges>,
    pub vnodes: Arc<VNodeTracker>,
    pub updates: broadcast::Sender<StateView>,
}

impl Default for AppState {
    fn default() -> Self {
        let (updates, _) = broadcast::channel(16);
        Self {
            forest: Arc::new(Mutex::new(Forest::new())),
            gauges: Gauges::new(),
            vnodes: VNodeTracker::new(),
            updates,
        }
    }
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StateView {
        StateView {
            namespaces: self.forest.lock().unwrap().summaries(),
            patrol: self.gauges.snapshot(),
            virtual_nodes: self.vnodes.summaries(),
        }
    }

    /// Publishes a fresh snapshot to stream subscribers whenever the state
    /// changed since the last tick.
    pub async fn run_publisher(self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(2));
        let mut last = String::new();
        loop {
            ticker.tick().await;
            let view = self.snapshot();
            let fingerprint = serde_json::to_string(&view).unwrap_or_default();
            if fingerprint != last {
                last = fingerprint;
                let _ = self.updates.send(view);
            }
        }
    }
}
