//! End-to-end hierarchy scenarios against a disposable k3s cluster: the
//! controllers run in-process while the test drives the API server.

use super::{TestCluster, TestResources};
use canopy::api::ANNOTATION_INHERITED_FROM;
use canopy::config::Config;
use canopy::server::CanopyServer;
use canopy::api::v1alpha2::SyncMode;

async fn start_controllers(
    cluster: &TestCluster,
) -> Result<std::net::SocketAddr, Box<dyn std::error::Error>> {
    let server =
        CanopyServer::new_with_client("127.0.0.1:0", cluster.client.clone(), Config::default())
            .await?;
    let addr = server.addr;
    tokio::spawn(async move {
        if let Err(e) = server.serve().await {
            eprintln!("controller server exited: {e}");
        }
    });
    Ok(addr)
}

#[tokio::test]
async fn tree_labels_and_secret_propagation() -> Result<(), Box<dyn std::error::Error>> {
    let cluster = TestCluster::new().await?;
    let addr = start_controllers(&cluster).await?;
    let res = TestResources::new(cluster.client.clone());

    res.create_namespace("acme-org").await?;
    res.create_namespace("team-a").await?;
    res.set_parent("team-a", Some("acme-org")).await?;

    // The hierarchy reconciler stamps depth labels for the whole ancestry.
    let labelled = res
        .wait_for(30, || async {
            let ns = res.get_namespace("team-a").await?;
            Ok(ns
                .map(|ns| {
                    TestResources::namespace_labels(&ns)
                        .get("acme-org.tree.hnc.x-k8s.io/depth")
                        .map(|v| v == "1")
                        .unwrap_or(false)
                })
                .unwrap_or(false))
        })
        .await?;
    assert!(labelled, "tree labels never appeared on team-a");

    // Secrets start in Ignore: no propagation.
    res.set_secret_mode(SyncMode::Ignore).await?;
    res.create_secret("acme-org", "org-creds").await?;
    tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
    assert!(res.get_secret("team-a", "org-creds").await?.is_none());

    // Flip to Propagate: the copy must appear with provenance.
    res.set_secret_mode(SyncMode::Propagate).await?;
    let propagated = res
        .wait_for(30, || async {
            let secret = res.get_secret("team-a", "org-creds").await?;
            Ok(secret
                .and_then(|s| s.metadata.annotations)
                .map(|a| a.get(ANNOTATION_INHERITED_FROM).map(String::as_str) == Some("acme-org"))
                .unwrap_or(false))
        })
        .await?;
    assert!(propagated, "secret never propagated to team-a");

    // The state surface reflects the same forest.
    let state: serde_json::Value = reqwest::get(format!("http://{addr}/state"))
        .await?
        .json()
        .await?;
    let names: Vec<&str> = state["namespaces"]
        .as_array()
        .map(|a| a.iter().filter_map(|n| n["name"].as_str()).collect())
        .unwrap_or_default();
    assert!(names.contains(&"acme-org"));
    assert!(names.contains(&"team-a"));

    res.cleanup_namespace("team-a").await?;
    res.cleanup_namespace("acme-org").await?;
    cluster.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn anchor_creates_subnamespace_and_faulty_anchor_leaves_it() -> Result<(), Box<dyn std::error::Error>>
{
    let cluster = TestCluster::new().await?;
    start_controllers(&cluster).await?;
    let res = TestResources::new(cluster.client.clone());

    res.create_namespace("parent-ns").await?;
    res.create_anchor("parent-ns", "child-ns").await?;

    let created = res
        .wait_for(30, || async {
            Ok(res.get_namespace("child-ns").await?.is_some())
        })
        .await?;
    assert!(created, "anchor never created the subnamespace");

    // Strip the ownership annotation, then delete the anchor: the
    // namespace must survive.
    res.strip_subnamespace_annotation("child-ns").await?;
    tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
    res.delete_anchor("parent-ns", "child-ns").await?;

    let gone = res
        .wait_for(10, || async {
            Ok(res.get_namespace("child-ns").await?.is_none())
        })
        .await?;
    assert!(!gone, "faulty-anchor namespace must survive anchor deletion");

    res.cleanup_namespace("child-ns").await?;
    res.cleanup_namespace("parent-ns").await?;
    cluster.cleanup().await?;
    Ok(())
}
