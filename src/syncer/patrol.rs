//! Patrol scheduling and the per-kind drift gauges it publishes.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

use crate::syncer::{SyncedKind, Syncer};

/// Result of the most recent patrol scan for one kind, refreshed wholesale
/// each round and served on `/state`.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct KindGauges {
    pub num_mismatched: u64,
    pub num_requeued: u64,
    pub num_deleted_orphans: u64,
}

#[derive(Default)]
pub struct Gauges {
    kinds: Mutex<BTreeMap<&'static str, KindGauges>>,
}

impl Gauges {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, kind: &'static str, mismatched: u64, requeued: u64, deleted_orphans: u64) {
        self.kinds.lock().unwrap().insert(
            kind,
            KindGauges {
                num_mismatched: mismatched,
                num_requeued: requeued,
                num_deleted_orphans: deleted_orphans,
            },
        );
    }

    pub fn snapshot(&self) -> BTreeMap<String, KindGauges> {
        self.kinds
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }
}

/// Full scan per kind on a fixed period. Patrol errors are contained per
/// cluster so one failing tenant cannot starve the others.
pub async fn run<R: SyncedKind>(syncer: Arc<Syncer<R>>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        for cluster in syncer.ctx.registry.all() {
            if let Err(e) = syncer.patrol_cluster(&cluster).await {
                warn!(
                    kind = syncer.kind.kind(),
                    cluster = %cluster.name,
                    error = %e,
                    "patrol scan failed"
                );
            }
        }
    }
}
