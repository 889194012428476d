use canopy::api::v1alpha2::{HNCConfiguration, HierarchyConfiguration, SubnamespaceAnchor};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Api, Client, Config, CustomResourceExt};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::k3s::K3s;

pub struct TestCluster {
    pub container: ContainerAsync<K3s>,
    pub client: Client,
}

impl TestCluster {
    pub async fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let temp_dir = std::env::temp_dir().join(format!("k3s-canopy-{}", std::process::id()));
        std::fs::create_dir_all(&temp_dir)?;

        let container = K3s::default()
            .with_conf_mount(&temp_dir)
            .with_privileged(true)
            .start()
            .await?;

        let kubeconfig_yaml = container.image().read_kube_config()?;
        let mut kubeconfig: kube::config::Kubeconfig = serde_yaml::from_str(&kubeconfig_yaml)?;

        let kube_port = container.get_host_port_ipv4(6443).await?;
        let server_url = format!("https://127.0.0.1:{}", kube_port);

        if let Some(cluster) = kubeconfig.clusters.first_mut() {
            cluster.cluster.as_mut().unwrap().server = Some(server_url);
        }

        let client = Client::try_from(
            Config::from_custom_kubeconfig(kubeconfig, &Default::default()).await?,
        )?;

        let cluster = TestCluster { container, client };
        cluster.install_crds().await?;
        Ok(cluster)
    }

    /// Installs the three CRDs the controllers serve.
    pub async fn install_crds(&self) -> Result<(), Box<dyn std::error::Error>> {
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        for crd in [
            HierarchyConfiguration::crd(),
            SubnamespaceAnchor::crd(),
            HNCConfiguration::crd(),
        ] {
            match crds.create(&Default::default(), &crd).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 409 => {}
                Err(e) => return Err(e.into()),
            }
        }
        // Give the API server a moment to serve the new groups.
        tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
        Ok(())
    }

    pub async fn cleanup(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.container.stop().await?;
        Ok(())
    }
}
