use std::collections::BTreeMap;

use canopy::api::v1alpha2::{
    HNCConfiguration, HNCConfigurationSpec, HierarchyConfiguration, HierarchyConfigurationSpec,
    ResourceSpec, SubnamespaceAnchor, SubnamespaceAnchorSpec, SyncMode,
};
use canopy::api::{CONFIG_SINGLETON, HIERARCHY_SINGLETON};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};

pub struct TestResources {
    pub client: Client,
}

impl TestResources {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn create_namespace(&self, name: &str) -> Result<(), Box<dyn std::error::Error>> {
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        match namespaces.create(&Default::default(), &namespace).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Declares `parent` as the parent of `ns` through the hierarchy
    /// singleton.
    pub async fn set_parent(
        &self,
        ns: &str,
        parent: Option<&str>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let api: Api<HierarchyConfiguration> = Api::namespaced(self.client.clone(), ns);
        let mut hc = HierarchyConfiguration::new(
            HIERARCHY_SINGLETON,
            HierarchyConfigurationSpec {
                parent: parent.map(str::to_string),
                allow_cascading_deletion: false,
            },
        );
        hc.metadata.namespace = Some(ns.to_string());
        match api.create(&PostParams::default(), &hc).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                let patch = serde_json::json!({"spec": {"parent": parent}});
                api.patch(
                    HIERARCHY_SINGLETON,
                    &PatchParams::default(),
                    &Patch::Merge(&patch),
                )
                .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn create_anchor(
        &self,
        parent: &str,
        child: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let api: Api<SubnamespaceAnchor> = Api::namespaced(self.client.clone(), parent);
        let mut anchor = SubnamespaceAnchor::new(child, SubnamespaceAnchorSpec {});
        anchor.metadata.namespace = Some(parent.to_string());
        match api.create(&PostParams::default(), &anchor).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete_anchor(
        &self,
        parent: &str,
        child: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let api: Api<SubnamespaceAnchor> = Api::namespaced(self.client.clone(), parent);
        match api.delete(child, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn set_secret_mode(
        &self,
        mode: SyncMode,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let api: Api<HNCConfiguration> = Api::all(self.client.clone());
        let cfg = HNCConfiguration::new(
            CONFIG_SINGLETON,
            HNCConfigurationSpec {
                resources: vec![ResourceSpec {
                    group: String::new(),
                    resource: "secrets".to_string(),
                    mode,
                }],
            },
        );
        match api.create(&PostParams::default(), &cfg).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                let patch = serde_json::json!({"spec": cfg.spec});
                api.patch(
                    CONFIG_SINGLETON,
                    &PatchParams::default(),
                    &Patch::Merge(&patch),
                )
                .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn create_secret(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let mut data = BTreeMap::new();
        data.insert("password".to_string(), ByteString(b"hunter2".to_vec()));
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        let api: Api<Secret> = Api::namespaced(self.client.clone(), ns);
        match api.create(&Default::default(), &secret).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_secret(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<Secret>, Box<dyn std::error::Error>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), ns);
        Ok(api.get_opt(name).await?)
    }

    pub async fn get_namespace(
        &self,
        name: &str,
    ) -> Result<Option<Namespace>, Box<dyn std::error::Error>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    /// Removes the subnamespace-of annotation, turning a subnamespace into
    /// a regular namespace from the controller's point of view.
    pub async fn strip_subnamespace_annotation(
        &self,
        ns: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "metadata": {"annotations": {"hnc.x-k8s.io/subnamespace-of": null}}
        });
        api.patch(ns, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    pub async fn cleanup_namespace(&self, ns: &str) -> Result<(), Box<dyn std::error::Error>> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        match namespaces.delete(ns, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Polls until `check` returns true or the timeout elapses.
    pub async fn wait_for<F, Fut>(
        &self,
        timeout_secs: u64,
        mut check: F,
    ) -> Result<bool, Box<dyn std::error::Error>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<bool, Box<dyn std::error::Error>>>,
    {
        for _ in 0..timeout_secs * 2 {
            if check().await? {
                return Ok(true);
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
        }
        Ok(false)
    }

    pub fn namespace_labels(ns: &Namespace) -> BTreeMap<String, String> {
        ns.labels().clone()
    }
}
