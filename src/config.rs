use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::errors::{Error, Result};

pub const CONFIG_ENV: &str = "CANOPY_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "canopy.yaml";

/// Runtime configuration for the syncer half of the controller.
///
/// The hierarchy controllers need nothing beyond the in-cluster client; this
/// file only describes the tenant topology and the knobs of the projection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub clusters: Vec<TenantCluster>,
    pub projection: ProjectionConfig,
    #[serde(rename = "patrolPeriodSeconds")]
    pub patrol_period_seconds: Option<u64>,
    #[serde(rename = "vnodeGraceSeconds")]
    pub vnode_grace_seconds: Option<u64>,
}

/// One tenant control plane to bridge into the super cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantCluster {
    pub name: String,
    pub kubeconfig: String,
    pub vc_name: String,
    pub vc_namespace: String,
}

/// Per-virtual-cluster projection settings consumed by the equality layer
/// and the pod mutators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectionConfig {
    /// Metadata key prefixes that flow super -> tenant on upward sync.
    pub transparent_meta_prefixes: Vec<String>,
    /// Metadata key prefixes that never cross the boundary in either
    /// direction.
    pub opaque_meta_prefixes: Vec<String>,
    pub disable_service_links: bool,
    pub disable_pod_service_account_token: bool,
    /// Nameserver injected into tenant pods so DNS resolves against the
    /// tenant view rather than the super cluster.
    pub cluster_dns_ip: Option<String>,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            transparent_meta_prefixes: vec!["transparency.tenancy.x-k8s.io".to_string()],
            opaque_meta_prefixes: vec!["tenancy.x-k8s.io".to_string()],
            disable_service_links: false,
            disable_pod_service_account_token: false,
            cluster_dns_ip: None,
        }
    }
}

impl Config {
    /// Loads the config from `CANOPY_CONFIG` (or ./canopy.yaml). A missing
    /// file is not an error: it means no tenant clusters, hierarchy-only.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        if !Path::new(&path).exists() {
            return Ok(Self::default());
        }
        Self::from_path(&path)
    }

    pub fn from_path(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {path}: {e}")))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let cfg: Config =
            serde_yaml::from_str(raw).map_err(|e| Error::Config(format!("parsing config: {e}")))?;
        for cluster in &cfg.clusters {
            crate::syncer::conversion::validate_cluster_name(&cluster.name)?;
        }
        Ok(cfg)
    }

    pub fn patrol_period(&self) -> Duration {
        Duration::from_secs(self.patrol_period_seconds.unwrap_or(60))
    }

    pub fn vnode_grace(&self) -> Duration {
        Duration::from_secs(self.vnode_grace_seconds.unwrap_or(120))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_gives_defaults() {
        let cfg = Config::from_yaml("{}").unwrap();
        assert!(cfg.clusters.is_empty());
        assert_eq!(cfg.patrol_period(), Duration::from_secs(60));
        assert_eq!(cfg.vnode_grace(), Duration::from_secs(120));
    }

    #[test]
    fn parses_clusters_and_projection() {
        let raw = r#"
clusters:
  - name: tenant-a
    kubeconfig: /etc/canopy/tenant-a.kubeconfig
    vcName: vc-a
    vcNamespace: default
projection:
  transparentMetaPrefixes: ["transparency.tenancy.x-k8s.io"]
  disableServiceLinks: true
patrolPeriodSeconds: 15
"#;
        let cfg = Config::from_yaml(raw).unwrap();
        assert_eq!(cfg.clusters.len(), 1);
        assert_eq!(cfg.clusters[0].vc_name, "vc-a");
        assert!(cfg.projection.disable_service_links);
        assert_eq!(cfg.patrol_period(), Duration::from_secs(15));
    }

    #[test]
    fn rejects_cluster_name_too_long_for_super_namespaces() {
        let raw = format!(
            "clusters:\n  - name: {}\n    kubeconfig: /k\n    vcName: v\n    vcNamespace: d\n",
            "x".repeat(64)
        );
        assert!(Config::from_yaml(&raw).is_err());
    }
}
