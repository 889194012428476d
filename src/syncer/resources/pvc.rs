use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use kube::api::{Api, Patch, PatchParams};
use serde_json::json;
use std::sync::Arc;

use crate::config::ProjectionConfig;
use crate::errors::Result;
use crate::syncer::cluster::ClusterClient;
use crate::syncer::conversion::build_super_meta;
use crate::syncer::queue::SyncKey;
use crate::syncer::{SyncCtx, SyncedKind};

pub struct PvcSyncer;

#[async_trait]
impl SyncedKind for PvcSyncer {
    type Obj = PersistentVolumeClaim;

    fn kind(&self) -> &'static str {
        "persistentvolumeclaims"
    }

    async fn build_super(
        &self,
        _ctx: &SyncCtx,
        cluster: &Arc<ClusterClient>,
        v: &PersistentVolumeClaim,
        target_ns: &str,
    ) -> Result<PersistentVolumeClaim> {
        Ok(PersistentVolumeClaim {
            metadata: build_super_meta(&v.metadata, &cluster.name, target_ns, cluster.owner_info()),
            spec: v.spec.clone(),
            status: None,
        })
    }

    /// Claim specs are immutable except the storage request (expansion).
    fn check_equality(
        &self,
        _cfg: &ProjectionConfig,
        p: &PersistentVolumeClaim,
        v: &PersistentVolumeClaim,
    ) -> Option<PersistentVolumeClaim> {
        let v_requests = v.spec.as_ref().and_then(|s| s.resources.as_ref()).and_then(|r| r.requests.as_ref());
        let p_requests = p.spec.as_ref().and_then(|s| s.resources.as_ref()).and_then(|r| r.requests.as_ref());
        if v_requests == p_requests {
            return None;
        }
        let mut updated = p.clone();
        if let (Some(spec), Some(v_spec)) = (updated.spec.as_mut(), v.spec.as_ref()) {
            spec.resources = v_spec.resources.clone();
        }
        Some(updated)
    }

    /// Bound phase and allocated capacity flow back to the tenant claim.
    async fn back_populate(
        &self,
        _ctx: &SyncCtx,
        cluster: &Arc<ClusterClient>,
        key: &SyncKey,
        v: &PersistentVolumeClaim,
        p: &PersistentVolumeClaim,
    ) -> Result<()> {
        if p.status == v.status || p.status.is_none() {
            return Ok(());
        }
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(cluster.client.clone(), &key.namespace);
        let patch = json!({"status": p.status});
        api.patch_status(&v.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
