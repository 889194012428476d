use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use kube::api::{Api, ListParams};
use std::sync::Arc;

use crate::config::ProjectionConfig;
use crate::errors::Result;
use crate::syncer::cluster::ClusterClient;
use crate::syncer::conversion::{LABEL_SECRET_UID, build_super_meta};
use crate::syncer::equality::{check_secret_equality, is_service_account_token};
use crate::syncer::{SyncCtx, SyncedKind};

pub struct SecretSyncer;

#[async_trait]
impl SyncedKind for SecretSyncer {
    type Obj = Secret;

    fn kind(&self) -> &'static str {
        "secrets"
    }

    async fn build_super(
        &self,
        _ctx: &SyncCtx,
        cluster: &Arc<ClusterClient>,
        v: &Secret,
        target_ns: &str,
    ) -> Result<Secret> {
        let mut meta = build_super_meta(&v.metadata, &cluster.name, target_ns, cluster.owner_info());
        let mut type_ = v.type_.clone();

        if is_service_account_token(v) {
            // The tenant token controller minted the name; the super copy
            // gets a generated name, is found by UID label, and is
            // stored Opaque so the super token controller leaves it alone.
            meta.generate_name = Some(format!("{}-token-", cluster.name));
            meta.name = None;
            let mut labels = meta.labels.take().unwrap_or_default();
            labels.insert(
                LABEL_SECRET_UID.to_string(),
                v.uid().unwrap_or_default(),
            );
            meta.labels = Some(labels);
            type_ = Some("Opaque".to_string());
        }

        Ok(Secret {
            metadata: meta,
            data: v.data.clone(),
            string_data: v.string_data.clone(),
            immutable: v.immutable,
            type_,
        })
    }

    async fn find_super(
        &self,
        _ctx: &SyncCtx,
        api: &Api<Secret>,
        v: Option<&Secret>,
        name: &str,
    ) -> Result<Option<Secret>> {
        if let Some(v) = v {
            if is_service_account_token(v) {
                let selector = format!("{LABEL_SECRET_UID}={}", v.uid().unwrap_or_default());
                let list = api
                    .list(&ListParams::default().labels(&selector))
                    .await?;
                return Ok(list.items.into_iter().next());
            }
        }
        Ok(api.get_opt(name).await?)
    }

    fn check_equality(&self, _cfg: &ProjectionConfig, p: &Secret, v: &Secret) -> Option<Secret> {
        check_secret_equality(p, v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syncer::equality::SERVICE_ACCOUNT_TOKEN_TYPE;

    #[test]
    fn sa_token_drift_is_never_reported() {
        let s = SecretSyncer;
        let cfg = ProjectionConfig::default();
        let p = Secret {
            type_: Some(SERVICE_ACCOUNT_TOKEN_TYPE.to_string()),
            ..Default::default()
        };
        let v = p.clone();
        assert!(s.check_equality(&cfg, &p, &v).is_none());
    }
}
