//! Syncer scenarios across two live clusters: one k3s plays the tenant
//! control plane, the other the super cluster. Only the syncer machinery
//! runs; the hierarchy controllers are not involved.

use std::collections::BTreeMap;
use std::time::Duration;

use canopy::config::ProjectionConfig;
use canopy::syncer::cluster::{ClusterClient, ClusterRegistry};
use canopy::syncer::conversion::{
    ANNOTATION_ADOPTABLE, ANNOTATION_CLUSTER, ANNOTATION_NAMESPACE, ANNOTATION_UID,
    LABEL_VIRTUAL_NODE, OwnerInfo, to_super,
};
use canopy::syncer::patrol::Gauges;
use canopy::syncer::vnode::VNodeTracker;
use canopy::syncer::{SyncCtx, resources};
use k8s_openapi::api::core::v1::{
    Container, Namespace, Node, Pod, PodSpec, Secret, Service, ServicePort, ServiceSpec,
};
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::ResourceExt;

use super::{TestCluster, TestResources};

const TENANT: &str = "tenant-a";

/// Wires the syncer between the two clusters with default projection
/// settings and a short patrol period.
fn start_syncer(
    tenant: &TestCluster,
    super_cluster: &TestCluster,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = ClusterRegistry::new();
    let ctx = SyncCtx {
        registry: registry.clone(),
        super_client: super_cluster.client.clone(),
        projection: ProjectionConfig::default(),
        vnodes: VNodeTracker::new(),
        gauges: Gauges::new(),
    };
    resources::start_all(&ctx, Duration::from_secs(5));
    let cluster = ClusterClient::new(
        TENANT.to_string(),
        tenant.client.clone(),
        OwnerInfo {
            vc_name: "vc-a".to_string(),
            vc_namespace: "default".to_string(),
            uid: String::new(),
        },
    )?;
    registry.register(cluster);
    Ok(())
}

/// Modern control planes only populate explicitly created token secrets,
/// so the test plays the tenant token controller's part.
async fn create_tenant_token_secret(
    tenant: &TestCluster,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut annotations = BTreeMap::new();
    annotations.insert(
        "kubernetes.io/service-account.name".to_string(),
        "default".to_string(),
    );
    let token = Secret {
        metadata: ObjectMeta {
            name: Some("default-token-test".to_string()),
            namespace: Some("default".to_string()),
            annotations: Some(annotations),
            ..Default::default()
        },
        type_: Some("kubernetes.io/service-account-token".to_string()),
        ..Default::default()
    };
    let secrets: Api<Secret> = Api::namespaced(tenant.client.clone(), "default");
    match secrets.create(&PostParams::default(), &token).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[tokio::test]
async fn tenant_pod_is_projected_scheduled_and_bound() -> Result<(), Box<dyn std::error::Error>> {
    let tenant = TestCluster::new().await?;
    let super_cluster = TestCluster::new().await?;
    start_syncer(&tenant, &super_cluster)?;

    // Label the super node so the pod can only be placed there; the same
    // selector keeps the tenant's own scheduler away from it.
    let super_nodes: Api<Node> = Api::all(super_cluster.client.clone());
    let super_node = super_nodes
        .list(&Default::default())
        .await?
        .items
        .first()
        .and_then(|n| n.metadata.name.clone())
        .expect("super cluster has a node");
    let label_patch = serde_json::json!({"metadata": {"labels": {"tenancy-tier": "super"}}});
    super_nodes
        .patch(&super_node, &PatchParams::default(), &Patch::Merge(&label_patch))
        .await?;

    create_tenant_token_secret(&tenant).await?;

    let mut node_selector = BTreeMap::new();
    node_selector.insert("tenancy-tier".to_string(), "super".to_string());
    let pod = Pod {
        metadata: ObjectMeta {
            name: Some("pod-1".to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                image: Some("busybox:latest".to_string()),
                command: Some(vec!["sleep".to_string(), "3600".to_string()]),
                ..Default::default()
            }],
            node_selector: Some(node_selector),
            ..Default::default()
        }),
        ..Default::default()
    };
    let pods: Api<Pod> = Api::namespaced(tenant.client.clone(), "default");
    pods.create(&PostParams::default(), &pod).await?;
    let v_uid = pods.get("pod-1").await?.uid().unwrap_or_default();

    // Downward: the projection appears in the mapped super namespace,
    // bound by UID.
    let super_ns = to_super(TENANT, "default");
    let p_pods: Api<Pod> = Api::namespaced(super_cluster.client.clone(), &super_ns);
    let res = TestResources::new(tenant.client.clone());
    let projected = res
        .wait_for(120, || async {
            Ok(p_pods
                .get_opt("pod-1")
                .await?
                .and_then(|p| p.annotations().get(ANNOTATION_UID).cloned())
                .map(|u| u == v_uid)
                .unwrap_or(false))
        })
        .await?;
    assert!(projected, "super pod never created");

    // Upward: once the super scheduler places the projection, the tenant
    // pod is bound to the same node.
    let bound = res
        .wait_for(120, || async {
            let v = pods.get("pod-1").await?;
            Ok(v.spec.and_then(|s| s.node_name).as_deref() == Some(super_node.as_str()))
        })
        .await?;
    assert!(bound, "tenant pod never bound to the super node");

    // The node now exists in the tenant view, marked virtual.
    let tenant_nodes: Api<Node> = Api::all(tenant.client.clone());
    let vnode = tenant_nodes.get(&super_node).await?;
    assert_eq!(
        vnode.labels().get(LABEL_VIRTUAL_NODE).map(String::as_str),
        Some("true")
    );

    tenant.cleanup().await?;
    super_cluster.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn adoptable_service_is_adopted_not_deleted() -> Result<(), Box<dyn std::error::Error>> {
    let tenant = TestCluster::new().await?;
    let super_cluster = TestCluster::new().await?;
    start_syncer(&tenant, &super_cluster)?;

    let super_ns = to_super(TENANT, "default");
    let namespaces: Api<Namespace> = Api::all(super_cluster.client.clone());
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(super_ns.clone()),
            ..Default::default()
        },
        ..Default::default()
    };
    match namespaces.create(&PostParams::default(), &ns).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 409 => {}
        Err(e) => return Err(e.into()),
    }

    // A pre-existing super service tagged adoptable, with no bound UID.
    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_CLUSTER.to_string(), TENANT.to_string());
    annotations.insert(ANNOTATION_NAMESPACE.to_string(), "default".to_string());
    annotations.insert(ANNOTATION_ADOPTABLE.to_string(), "true".to_string());
    let p_svc = Service {
        metadata: ObjectMeta {
            name: Some("svc-adopt".to_string()),
            namespace: Some(super_ns.clone()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                port: 80,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };
    let p_services: Api<Service> = Api::namespaced(super_cluster.client.clone(), &super_ns);
    p_services.create(&PostParams::default(), &p_svc).await?;

    // The tenant peer appears: the syncer must bind its UID to the super
    // object instead of collecting it as an orphan.
    let v_svc = Service {
        metadata: ObjectMeta {
            name: Some("svc-adopt".to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                port: 80,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };
    let v_services: Api<Service> = Api::namespaced(tenant.client.clone(), "default");
    v_services.create(&PostParams::default(), &v_svc).await?;
    let v_uid = v_services.get("svc-adopt").await?.uid().unwrap_or_default();

    let res = TestResources::new(tenant.client.clone());
    let adopted = res
        .wait_for(60, || async {
            Ok(p_services
                .get_opt("svc-adopt")
                .await?
                .and_then(|p| p.annotations().get(ANNOTATION_UID).cloned())
                .map(|u| u == v_uid)
                .unwrap_or(false))
        })
        .await?;
    assert!(adopted, "super service was deleted or never adopted");

    tenant.cleanup().await?;
    super_cluster.cleanup().await?;
    Ok(())
}
