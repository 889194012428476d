use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use std::sync::Arc;

use crate::config::ProjectionConfig;
use crate::errors::Result;
use crate::syncer::cluster::ClusterClient;
use crate::syncer::conversion::build_super_meta;
use crate::syncer::{SyncCtx, SyncedKind};

pub struct ServiceAccountSyncer;

#[async_trait]
impl SyncedKind for ServiceAccountSyncer {
    type Obj = ServiceAccount;

    fn kind(&self) -> &'static str {
        "serviceaccounts"
    }

    async fn build_super(
        &self,
        _ctx: &SyncCtx,
        cluster: &Arc<ClusterClient>,
        v: &ServiceAccount,
        target_ns: &str,
    ) -> Result<ServiceAccount> {
        Ok(ServiceAccount {
            metadata: build_super_meta(&v.metadata, &cluster.name, target_ns, cluster.owner_info()),
            // Token secret references do not cross the boundary: the super
            // copies of tenant tokens have minted names of their own.
            secrets: None,
            image_pull_secrets: v.image_pull_secrets.clone(),
            automount_service_account_token: Some(false),
        })
    }

    fn check_equality(
        &self,
        _cfg: &ProjectionConfig,
        p: &ServiceAccount,
        v: &ServiceAccount,
    ) -> Option<ServiceAccount> {
        if p.image_pull_secrets == v.image_pull_secrets {
            return None;
        }
        let mut updated = p.clone();
        updated.image_pull_secrets = v.image_pull_secrets.clone();
        Some(updated)
    }
}
