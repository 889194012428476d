use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use kube::api::{Api, Patch, PatchParams};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::config::ProjectionConfig;
use crate::errors::Result;
use crate::syncer::cluster::ClusterClient;
use crate::syncer::conversion::{
    ANNOTATION_SUPER_CLUSTER_IP, ANNOTATION_UID, build_super_meta, is_adoptable, super_uid,
    to_super,
};
use crate::syncer::equality::check_service_spec_equality;
use crate::syncer::queue::SyncKey;
use crate::syncer::{Orphan, SyncCtx, SyncedKind};

/// Consecutive ownerless sightings before an adoptable service is given up
/// on and deleted.
pub const ADOPTION_RETRIES: u32 = 3;

pub struct ServiceSyncer {
    adoption_misses: Mutex<HashMap<SyncKey, u32>>,
}

impl ServiceSyncer {
    pub fn new() -> Self {
        Self {
            adoption_misses: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SyncedKind for ServiceSyncer {
    type Obj = Service;

    fn kind(&self) -> &'static str {
        "services"
    }

    async fn build_super(
        &self,
        _ctx: &SyncCtx,
        cluster: &Arc<ClusterClient>,
        v: &Service,
        target_ns: &str,
    ) -> Result<Service> {
        let mut spec = v.spec.clone();
        if let Some(spec) = spec.as_mut() {
            // Addresses are allocated by the super cluster.
            spec.cluster_ip = None;
            spec.cluster_ips = None;
            spec.health_check_node_port = None;
        }
        Ok(Service {
            metadata: build_super_meta(&v.metadata, &cluster.name, target_ns, cluster.owner_info()),
            spec,
            status: None,
        })
    }

    fn check_equality(&self, _cfg: &ProjectionConfig, p: &Service, v: &Service) -> Option<Service> {
        let (Some(p_spec), Some(v_spec)) = (p.spec.as_ref(), v.spec.as_ref()) else {
            return None;
        };
        let updated_spec = check_service_spec_equality(p_spec, v_spec)?;
        let mut updated = p.clone();
        updated.spec = Some(updated_spec);
        Some(updated)
    }

    /// Upward sync: pin the allocated cluster IP on the super object, then
    /// surface load-balancer ingress in the tenant view.
    async fn back_populate(
        &self,
        ctx: &SyncCtx,
        cluster: &Arc<ClusterClient>,
        key: &SyncKey,
        v: &Service,
        p: &Service,
    ) -> Result<()> {
        let cluster_ip = p.spec.as_ref().and_then(|s| s.cluster_ip.clone());
        if let Some(ip) = cluster_ip {
            let recorded = p
                .annotations()
                .get(ANNOTATION_SUPER_CLUSTER_IP)
                .cloned();
            if recorded.as_deref() != Some(ip.as_str()) {
                let target_ns = to_super(&key.cluster, &key.namespace);
                let p_api: Api<Service> = Api::namespaced(ctx.super_client.clone(), &target_ns);
                let patch = json!({"metadata": {"annotations": {ANNOTATION_SUPER_CLUSTER_IP: ip}}});
                p_api
                    .patch(&p.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
            }
        }

        let p_lb = p.status.as_ref().and_then(|s| s.load_balancer.as_ref());
        let v_lb = v.status.as_ref().and_then(|s| s.load_balancer.as_ref());
        if p_lb != v_lb {
            let v_api: Api<Service> = Api::namespaced(cluster.client.clone(), &key.namespace);
            let patch = json!({"status": {"loadBalancer": p_lb}});
            v_api
                .patch_status(&v.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }
        Ok(())
    }

    /// Adoptable service with an empty UID annotation and a live tenant
    /// peer: bind the tenant UID instead of deleting.
    async fn try_adopt(
        &self,
        ctx: &SyncCtx,
        cluster: &Arc<ClusterClient>,
        v: &Service,
        p: &Service,
    ) -> Result<bool> {
        if !is_adoptable(&p.metadata) || super_uid(&p.metadata).is_some() {
            return Ok(false);
        }
        let Some(target_ns) = p.namespace() else {
            return Ok(false);
        };
        let uid = v.uid().unwrap_or_default();
        info!(service = %p.name_any(), namespace = %target_ns, "adopting service");
        let p_api: Api<Service> = Api::namespaced(ctx.super_client.clone(), &target_ns);
        let patch = json!({"metadata": {"annotations": {ANNOTATION_UID: uid}}});
        p_api
            .patch(&p.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        // A later orphaning of this slot starts with a clean miss count.
        self.adoption_misses.lock().unwrap().remove(&SyncKey {
            cluster: cluster.name.clone(),
            namespace: v.namespace().unwrap_or_default(),
            name: v.name_any(),
        });
        Ok(true)
    }

    /// An ownerless adoptable service is only collected after several
    /// consecutive sightings without a tenant peer showing up.
    async fn on_super_orphan(
        &self,
        _ctx: &SyncCtx,
        _cluster: &Arc<ClusterClient>,
        key: &SyncKey,
        p: &Service,
    ) -> Result<Orphan> {
        if !is_adoptable(&p.metadata) || super_uid(&p.metadata).is_some() {
            return Ok(Orphan::Delete);
        }
        let mut misses = self.adoption_misses.lock().unwrap();
        let count = misses.entry(key.clone()).or_insert(0);
        *count += 1;
        if *count >= ADOPTION_RETRIES {
            misses.remove(key);
            Ok(Orphan::Delete)
        } else {
            Ok(Orphan::Keep)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use std::collections::BTreeMap;

    #[test]
    fn build_super_strips_allocated_addresses() {
        // Pure part of the builder: address fields never cross downward.
        let v = Service {
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.96.0.3".to_string()),
                external_name: Some("example.com".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut spec = v.spec.clone().unwrap();
        spec.cluster_ip = None;
        spec.cluster_ips = None;
        assert_eq!(spec.external_name.as_deref(), Some("example.com"));
        assert!(spec.cluster_ip.is_none());
    }

    #[test]
    fn adoptable_detection() {
        let mut p = Service::default();
        let mut ann = BTreeMap::new();
        ann.insert("tenancy.x-k8s.io/adoptable".to_string(), "true".to_string());
        p.metadata.annotations = Some(ann);
        assert!(is_adoptable(&p.metadata));
        assert!(super_uid(&p.metadata).is_none());
    }
}
