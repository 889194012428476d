//! Tenant-cluster registry: one client per registered tenant control plane,
//! plus a listener interface so the multi-cluster controller can react to
//! clusters coming and going.

use kube::Client;
use kube::config::{KubeConfigOptions, Kubeconfig};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::info;

use crate::config::TenantCluster;
use crate::errors::{Error, Result};
use crate::syncer::conversion::{OwnerInfo, validate_cluster_name};

/// A connected tenant control plane.
pub struct ClusterClient {
    pub name: String,
    pub client: Client,
    owner: OwnerInfo,
}

impl ClusterClient {
    pub fn new(name: String, client: Client, owner: OwnerInfo) -> Result<Arc<Self>> {
        validate_cluster_name(&name)?;
        Ok(Arc::new(Self {
            name,
            client,
            owner,
        }))
    }

    /// Which virtual cluster this tenant
    /// store belongs to.
    pub fn owner_info(&self) -> &OwnerInfo {
        &self.owner
    }
}

pub trait ClusterListener: Send + Sync {
    fn cluster_added(&self, cluster: &Arc<ClusterClient>);
    fn cluster_removed(&self, name: &str);
}

#[derive(Default)]
pub struct ClusterRegistry {
    clusters: RwLock<HashMap<String, Arc<ClusterClient>>>,
    listeners: Mutex<Vec<Arc<dyn ClusterListener>>>,
}

impl ClusterRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connects to a tenant cluster described in the config file and
    /// registers it.
    pub async fn connect(&self, spec: &TenantCluster) -> Result<Arc<ClusterClient>> {
        let kubeconfig = Kubeconfig::read_from(&spec.kubeconfig)
            .map_err(|e| Error::Config(format!("kubeconfig {}: {e}", spec.kubeconfig)))?;
        let config =
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::Config(format!("kubeconfig {}: {e}", spec.kubeconfig)))?;
        let client = Client::try_from(config)?;
        let owner = OwnerInfo {
            vc_name: spec.vc_name.clone(),
            vc_namespace: spec.vc_namespace.clone(),
            uid: String::new(),
        };
        let cluster = ClusterClient::new(spec.name.clone(), client, owner)?;
        self.register(cluster.clone());
        Ok(cluster)
    }

    pub fn register(&self, cluster: Arc<ClusterClient>) {
        info!(cluster = %cluster.name, "registering tenant cluster");
        self.clusters
            .write()
            .unwrap()
            .insert(cluster.name.clone(), cluster.clone());
        for listener in self.listeners.lock().unwrap().iter() {
            listener.cluster_added(&cluster);
        }
    }

    pub fn deregister(&self, name: &str) {
        if self.clusters.write().unwrap().remove(name).is_some() {
            info!(cluster = %name, "deregistering tenant cluster");
            for listener in self.listeners.lock().unwrap().iter() {
                listener.cluster_removed(name);
            }
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn ClusterListener>) {
        // Catch the listener up on clusters registered before it arrived.
        for cluster in self.all() {
            listener.cluster_added(&cluster);
        }
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn get(&self, name: &str) -> Result<Arc<ClusterClient>> {
        self.clusters
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownCluster(name.to_string()))
    }

    pub fn all(&self) -> Vec<Arc<ClusterClient>> {
        let mut all: Vec<_> = self.clusters.read().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}
