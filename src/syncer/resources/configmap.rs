use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use std::sync::Arc;

use crate::config::ProjectionConfig;
use crate::errors::Result;
use crate::syncer::cluster::ClusterClient;
use crate::syncer::conversion::build_super_meta;
use crate::syncer::{SyncCtx, SyncedKind};

pub struct ConfigMapSyncer;

#[async_trait]
impl SyncedKind for ConfigMapSyncer {
    type Obj = ConfigMap;

    fn kind(&self) -> &'static str {
        "configmaps"
    }

    async fn build_super(
        &self,
        _ctx: &SyncCtx,
        cluster: &Arc<ClusterClient>,
        v: &ConfigMap,
        target_ns: &str,
    ) -> Result<ConfigMap> {
        Ok(ConfigMap {
            metadata: build_super_meta(&v.metadata, &cluster.name, target_ns, cluster.owner_info()),
            data: v.data.clone(),
            binary_data: v.binary_data.clone(),
            immutable: v.immutable,
        })
    }

    fn check_equality(
        &self,
        _cfg: &ProjectionConfig,
        p: &ConfigMap,
        v: &ConfigMap,
    ) -> Option<ConfigMap> {
        if p.data == v.data && p.binary_data == v.binary_data {
            return None;
        }
        let mut updated = p.clone();
        updated.data = v.data.clone();
        updated.binary_data = v.binary_data.clone();
        Some(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn data_drift_is_detected_and_converges() {
        let s = ConfigMapSyncer;
        let cfg = ProjectionConfig::default();
        let mut v = ConfigMap::default();
        let mut data = BTreeMap::new();
        data.insert("key".to_string(), "tenant".to_string());
        v.data = Some(data);
        let p = ConfigMap::default();

        let updated = s.check_equality(&cfg, &p, &v).expect("drift expected");
        assert_eq!(updated.data, v.data);
        assert!(s.check_equality(&cfg, &updated, &v).is_none());
    }
}
