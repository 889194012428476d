//! Per-kind vtables over the generic DWS/UWS/patrol skeleton.

pub mod configmap;
pub mod pod;
pub mod pvc;
pub mod secret;
pub mod service;
pub mod serviceaccount;

use std::time::Duration;

use crate::syncer::SyncCtx;
use crate::syncer::mc;

/// Starts the syncers for every supported kind.
pub fn start_all(ctx: &SyncCtx, patrol_period: Duration) {
    mc::start(pod::PodSyncer::new(), ctx.clone(), patrol_period);
    mc::start(service::ServiceSyncer::new(), ctx.clone(), patrol_period);
    mc::start(secret::SecretSyncer, ctx.clone(), patrol_period);
    mc::start(
        serviceaccount::ServiceAccountSyncer,
        ctx.clone(),
        patrol_period,
    );
    mc::start(pvc::PvcSyncer, ctx.clone(), patrol_period);
    mc::start(configmap::ConfigMapSyncer, ctx.clone(), patrol_period);
}
