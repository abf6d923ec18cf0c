//! Operator configuration and Kubernetes client construction

use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info};

use crate::controller::{Error, Result};

/// Path of the in-cluster service account namespace file
const SERVICE_ACCOUNT_NAMESPACE_PATH: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Runtime options shared by every controller
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Headless service (and service account) governing database StatefulSets
    pub governing_service: String,
    /// Registry prefix for database, exporter and backup images
    pub docker_registry: String,
    /// Tag of the metrics exporter image
    pub exporter_tag: String,
    /// Explicit database image, overriding `<registry>/elasticsearch:<version>`
    pub elasticsearch_image: Option<String>,
    /// Namespace the controllers watch; `None` watches cluster-wide
    pub watch_namespace: Option<String>,
    /// Namespace the operator runs in
    pub operator_namespace: String,
    /// Interval of the periodic full resync
    pub resync_period: Duration,
    /// Bound on waiting for StatefulSet pods to become ready
    pub ready_timeout: Duration,
    /// Bound on waiting for backup and restore jobs
    pub job_timeout: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            governing_service: "kubedb".to_string(),
            docker_registry: "kubedb".to_string(),
            exporter_tag: "1.0.2".to_string(),
            elasticsearch_image: None,
            watch_namespace: None,
            operator_namespace: "default".to_string(),
            resync_period: Duration::from_secs(300),
            ready_timeout: Duration::from_secs(600),
            job_timeout: Duration::from_secs(1800),
        }
    }
}

impl OperatorConfig {
    /// Image of the database container for a version
    pub fn database_image(&self, version: &str) -> String {
        match &self.elasticsearch_image {
            Some(image) => image.clone(),
            None => format!("{}/elasticsearch:{}", self.docker_registry, version),
        }
    }

    /// Image of the `init-sysctl` init container
    pub fn init_image(&self) -> String {
        format!("{}/busybox", self.docker_registry)
    }

    /// Image of the metrics sidecar
    pub fn exporter_image(&self) -> String {
        format!(
            "{}/elasticsearch_exporter:{}",
            self.docker_registry, self.exporter_tag
        )
    }

    /// Image of the backup/restore job for a database version
    pub fn dump_image(&self, version: &str) -> String {
        format!("{}/elasticdump:{}", self.docker_registry, version)
    }
}

/// Resolve the namespace the operator itself runs in
///
/// Checks `OPERATOR_NAMESPACE`, then `POD_NAMESPACE`, then the service
/// account namespace file, and falls back to `default`.
pub fn operator_namespace() -> String {
    for var in ["OPERATOR_NAMESPACE", "POD_NAMESPACE"] {
        if let Ok(ns) = std::env::var(var)
            && !ns.trim().is_empty()
        {
            return ns.trim().to_string();
        }
    }
    std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_PATH)
        .ok()
        .map(|ns| ns.trim().to_string())
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| "default".to_string())
}

/// Build a Kubernetes client from optional `--master` and `--kubeconfig` flags
///
/// Without a kubeconfig path the usual inference applies (in-cluster config,
/// then `KUBECONFIG`/`~/.kube/config`). A master URL overrides whatever
/// server the chosen configuration names.
pub async fn kube_client(master: Option<&str>, kubeconfig: Option<&Path>) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            debug!(path = %path.display(), "Loading kubeconfig");
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| Error::InvalidConfig(format!("reading kubeconfig: {}", e)))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::InvalidConfig(format!("loading kubeconfig: {}", e)))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::InvalidConfig(format!("inferring kube config: {}", e)))?,
    };

    if let Some(master) = master.filter(|m| !m.is_empty()) {
        config.cluster_url = master
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("invalid master URL {}: {}", master, e)))?;
    }

    info!(cluster_url = %config.cluster_url, "Using Kubernetes API server");
    Ok(Client::try_from(config)?)
}
