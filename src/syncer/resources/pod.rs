use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Binding, Node, ObjectReference, Pod, PodDNSConfig, PodSpec, Secret, Volume, VolumeMount,
};
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Resource, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::ProjectionConfig;
use crate::errors::{Error, Result};
use crate::syncer::cluster::ClusterClient;
use crate::syncer::conversion::{LABEL_SECRET_UID, LABEL_VIRTUAL_NODE, build_super_meta, super_uid};
use crate::syncer::equality::{
    SERVICE_ACCOUNT_TOKEN_TYPE, check_pod_spec_equality, check_uw_meta_equality,
};
use crate::syncer::queue::SyncKey;
use crate::syncer::{PreCreate, SyncCtx, SyncedKind};

const SERVICE_ACCOUNT_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";
const TOKEN_MOUNT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const TOKEN_VOLUME: &str = "vc-service-account-token";

pub struct PodSyncer;

impl PodSyncer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SyncedKind for PodSyncer {
    type Obj = Pod;

    fn kind(&self) -> &'static str {
        "pods"
    }

    /// A tenant pod that already names a node cannot be scheduled by the
    /// super cluster; it is rejected with an event and never projected.
    async fn pre_create(
        &self,
        _ctx: &SyncCtx,
        cluster: &Arc<ClusterClient>,
        v: &Pod,
        _target_ns: &str,
    ) -> Result<PreCreate> {
        let preset = v
            .spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .map(|n| !n.is_empty())
            .unwrap_or(false);
        if !preset {
            return Ok(PreCreate::Proceed);
        }
        warn!(pod = %v.name_any(), "rejecting tenant pod with preset nodeName");
        let recorder = Recorder::new(
            cluster.client.clone(),
            Reporter {
                controller: "canopy-syncer".into(),
                instance: None,
            },
        );
        let ev = Event {
            type_: EventType::Warning,
            reason: "NotSupported".to_string(),
            note: Some("pods with a preset nodeName are not synced".to_string()),
            action: "DownwardSync".to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(&ev, &v.object_ref(&())).await {
            warn!(error = %e, "failed to publish NotSupported event");
        }
        Ok(PreCreate::Skip)
    }

    async fn build_super(
        &self,
        ctx: &SyncCtx,
        cluster: &Arc<ClusterClient>,
        v: &Pod,
        target_ns: &str,
    ) -> Result<Pod> {
        let tenant_ns = v.namespace().unwrap_or_default();
        let (v_secret_name, p_secret_name) =
            resolve_token_secret(ctx, cluster, v, &tenant_ns, target_ns).await?;

        let mut spec = v.spec.clone().unwrap_or_default();
        spec.node_name = None;
        mutate_pod_spec(&ctx.projection, &mut spec, &v_secret_name, &p_secret_name);

        Ok(Pod {
            metadata: build_super_meta(&v.metadata, &cluster.name, target_ns, cluster.owner_info()),
            spec: Some(spec),
            status: None,
        })
    }

    fn check_equality(&self, _cfg: &ProjectionConfig, p: &Pod, v: &Pod) -> Option<Pod> {
        let (Some(p_spec), Some(v_spec)) = (p.spec.as_ref(), v.spec.as_ref()) else {
            return None;
        };
        let updated_spec = check_pod_spec_equality(p_spec, v_spec)?;
        let mut updated = p.clone();
        updated.spec = Some(updated_spec);
        Some(updated)
    }

    /// Upward sync: bind the tenant pod once the super scheduler placed it,
    /// then mirror status and transparent metadata.
    async fn back_populate(
        &self,
        ctx: &SyncCtx,
        cluster: &Arc<ClusterClient>,
        key: &SyncKey,
        v: &Pod,
        p: &Pod,
    ) -> Result<()> {
        let p_node = p.spec.as_ref().and_then(|s| s.node_name.clone());
        let v_node = v.spec.as_ref().and_then(|s| s.node_name.clone());

        if let Some(node) = &p_node {
            if v_node.as_deref().map(str::is_empty).unwrap_or(true) {
                // GC race: a quiescing node is revived atomically; a node
                // already being deleted fails the bind and we requeue.
                ctx.vnodes.acquire_for_bind(&key.cluster, node)?;
                ensure_virtual_node(ctx, cluster, node).await?;
                bind_pod(cluster, &key.namespace, &v.name_any(), node).await?;
                ctx.vnodes
                    .track_pod(&key.cluster, node, &v.uid().unwrap_or_default());
                info!(pod = %v.name_any(), node = %node, cluster = %key.cluster, "bound tenant pod");
            }
        }

        let v_api: Api<Pod> = Api::namespaced(cluster.client.clone(), &key.namespace);
        if p.status != v.status && p.status.is_some() {
            let patch = json!({"status": p.status});
            v_api
                .patch_status(&v.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }

        if let Some(updated_meta) = check_uw_meta_equality(&ctx.projection, &p.metadata, &v.metadata)
        {
            let patch = json!({"metadata": {
                "labels": updated_meta.labels,
                "annotations": updated_meta.annotations,
            }});
            v_api
                .patch(&v.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }
        Ok(())
    }

    /// The super pod is going away on behalf of its tenant peer: release
    /// its node reference so the virtual node can quiesce.
    async fn pre_delete_super(&self, ctx: &SyncCtx, key: &SyncKey, p: &Pod) -> Result<()> {
        if let Some(node) = p.spec.as_ref().and_then(|s| s.node_name.as_deref()) {
            let uid = super_uid(&p.metadata).unwrap_or_default();
            ctx.vnodes.untrack_pod(&key.cluster, node, &uid);
        }
        Ok(())
    }
}

/// Finds the tenant SA-token secret backing this pod and its projection in
/// the super namespace. Pod creation is gated on the projection being
/// ready.
async fn resolve_token_secret(
    ctx: &SyncCtx,
    cluster: &Arc<ClusterClient>,
    v: &Pod,
    tenant_ns: &str,
    target_ns: &str,
) -> Result<(String, String)> {
    let sa_name = v
        .spec
        .as_ref()
        .and_then(|s| s.service_account_name.clone())
        .unwrap_or_else(|| "default".to_string());

    let v_secrets: Api<Secret> = Api::namespaced(cluster.client.clone(), tenant_ns);
    let v_secret = v_secrets
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .find(|s| {
            s.type_.as_deref() == Some(SERVICE_ACCOUNT_TOKEN_TYPE)
                && s.annotations().get(SERVICE_ACCOUNT_NAME_ANNOTATION) == Some(&sa_name)
        })
        .ok_or_else(|| Error::ServiceAccountNotReady(sa_name.clone()))?;

    let selector = format!("{LABEL_SECRET_UID}={}", v_secret.uid().unwrap_or_default());
    let p_secrets: Api<Secret> = Api::namespaced(ctx.super_client.clone(), target_ns);
    let p_secret = p_secrets
        .list(&ListParams::default().labels(&selector))
        .await?
        .items
        .into_iter()
        .next()
        .ok_or_else(|| Error::ServiceAccountNotReady(sa_name))?;

    Ok((v_secret.name_any(), p_secret.name_any()))
}

/// The pod mutators, in order: service links, DNS, token automount
/// replacement, secret-name remapping.
pub fn mutate_pod_spec(
    cfg: &ProjectionConfig,
    spec: &mut PodSpec,
    v_secret_name: &str,
    p_secret_name: &str,
) {
    if cfg.disable_service_links {
        spec.enable_service_links = Some(false);
    }

    if let Some(dns_ip) = &cfg.cluster_dns_ip {
        spec.dns_policy = Some("None".to_string());
        spec.dns_config = Some(PodDNSConfig {
            nameservers: Some(vec![dns_ip.clone()]),
            ..Default::default()
        });
    }

    // The super kubelet must not mount a super-cluster identity; the
    // tenant token is mounted explicitly instead.
    let automount = spec.automount_service_account_token;
    spec.automount_service_account_token = Some(false);
    spec.service_account_name = None;
    if automount != Some(false) && !cfg.disable_pod_service_account_token {
        let volumes = spec.volumes.get_or_insert_with(Vec::new);
        if !volumes.iter().any(|vol| vol.name == TOKEN_VOLUME) {
            volumes.push(Volume {
                name: TOKEN_VOLUME.to_string(),
                secret: Some(k8s_openapi::api::core::v1::SecretVolumeSource {
                    secret_name: Some(p_secret_name.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
        for container in spec.containers.iter_mut() {
            let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
            if !mounts.iter().any(|m| m.mount_path == TOKEN_MOUNT_PATH) {
                mounts.push(VolumeMount {
                    name: TOKEN_VOLUME.to_string(),
                    mount_path: TOKEN_MOUNT_PATH.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                });
            }
        }
    }

    // Tenant secret names do not exist in the super namespace.
    for volume in spec.volumes.iter_mut().flatten() {
        if let Some(source) = volume.secret.as_mut() {
            if source.secret_name.as_deref() == Some(v_secret_name) {
                source.secret_name = Some(p_secret_name.to_string());
            }
        }
    }
}

/// Materialises a tenant-view node mirroring the super node, if missing.
async fn ensure_virtual_node(
    ctx: &SyncCtx,
    cluster: &Arc<ClusterClient>,
    node_name: &str,
) -> Result<()> {
    let tenant_nodes: Api<Node> = Api::all(cluster.client.clone());
    if tenant_nodes.get_opt(node_name).await?.is_some() {
        return Ok(());
    }

    let super_nodes: Api<Node> = Api::all(ctx.super_client.clone());
    let super_node = super_nodes.get(node_name).await?;

    let mut labels = super_node.labels().clone();
    labels.insert(LABEL_VIRTUAL_NODE.to_string(), "true".to_string());
    let vnode = Node {
        metadata: ObjectMeta {
            name: Some(node_name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: None,
        status: None,
    };
    info!(node = %node_name, cluster = %cluster.name, "creating virtual node");
    match tenant_nodes.create(&PostParams::default(), &vnode).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 409 => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    if super_node.status.is_some() {
        let patch = json!({"status": super_node.status});
        tenant_nodes
            .patch_status(node_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
    }
    Ok(())
}

/// Binds a tenant pod to a node through the binding subresource.
async fn bind_pod(
    cluster: &Arc<ClusterClient>,
    namespace: &str,
    pod_name: &str,
    node_name: &str,
) -> Result<()> {
    let binding = Binding {
        metadata: ObjectMeta {
            name: Some(pod_name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        target: ObjectReference {
            kind: Some("Node".to_string()),
            name: Some(node_name.to_string()),
            ..Default::default()
        },
    };
    let pods: Api<Pod> = Api::namespaced(cluster.client.clone(), namespace);
    let data = serde_json::to_vec(&binding)?;
    let _: serde_json::Value = pods
        .create_subresource("binding", pod_name, &PostParams::default(), data)
        .await?;
    Ok(())
}
