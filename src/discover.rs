//! Cluster membership discovery for database pods
//!
//! Runs inside a database pod before Elasticsearch starts: waits for the
//! governing service and its endpoints, then writes the unicast host list
//! Elasticsearch reads at boot.

use std::path::{Path, PathBuf};
use std::time::Duration;

use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::{Api, Client};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::controller::error::{Error, Result};

/// Poll interval for the service and its endpoints
pub const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default location of the unicast hosts file
pub const DEFAULT_OUTPUT: &str = "/tmp/discovery/unicast-hosts";

#[derive(Clone, Debug)]
pub struct DiscoverOptions {
    pub namespace: String,
    pub service: String,
    pub output: PathBuf,
    /// Bound on each of the two waits
    pub timeout: Duration,
    /// Name of this pod, `<statefulset>-<ordinal>`
    pub pod_name: Option<String>,
}

/// Ordinal suffix of a StatefulSet pod name
pub fn pod_ordinal(pod_name: &str) -> Option<u32> {
    pod_name.rsplit('-').next()?.parse().ok()
}

/// Addresses of the ready endpoints, as DNS names where the pod has a hostname
pub fn endpoint_hosts(endpoints: &Endpoints, service: &str, namespace: &str) -> Vec<String> {
    endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|subset| subset.addresses.iter().flatten())
        .map(|addr| match addr.hostname.as_deref() {
            Some(hostname) if !hostname.is_empty() => {
                format!("{}.{}.{}.svc", hostname, service, namespace)
            }
            _ => addr.ip.clone(),
        })
        .collect()
}

/// Contents of the unicast hosts file
pub fn unicast_hosts_config(hosts: &[String]) -> String {
    format!("discovery.zen.ping.unicast.hosts: [{}]\n", hosts.join(", "))
}

/// Write `contents` to `path`, creating parent directories
pub fn write_hosts_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            Error::InvalidConfig(format!("creating {}: {}", parent.display(), e))
        })?;
    }
    std::fs::write(path, contents)
        .map_err(|e| Error::InvalidConfig(format!("writing {}: {}", path.display(), e)))
}

/// Run discovery and write the hosts file
///
/// A missing service is logged and leaves no file behind, so a standalone
/// node still boots.
pub async fn run_discover(client: Client, options: &DiscoverOptions) -> Result<()> {
    info!(
        service = %options.service,
        namespace = %options.namespace,
        "Searching for cluster members"
    );

    let services: Api<Service> = Api::namespaced(client.clone(), &options.namespace);
    if !wait_for_service(&services, options).await {
        warn!(service = %options.service, "Service not found, skipping discovery");
        return Ok(());
    }

    let endpoints: Api<Endpoints> = Api::namespaced(client, &options.namespace);
    let first_node = options
        .pod_name
        .as_deref()
        .and_then(pod_ordinal)
        .is_some_and(|ordinal| ordinal == 0);

    let Some(hosts) = wait_for_endpoints(&endpoints, options, first_node).await else {
        warn!(service = %options.service, "Endpoints not found, skipping discovery");
        return Ok(());
    };

    info!(hosts = ?hosts, "Discovered cluster members");
    write_hosts_file(&options.output, &unicast_hosts_config(&hosts))
}

async fn wait_for_service(api: &Api<Service>, options: &DiscoverOptions) -> bool {
    let deadline = Instant::now() + options.timeout;
    loop {
        match api.get_opt(&options.service).await {
            Ok(Some(_)) => return true,
            Ok(None) => debug!(service = %options.service, "Service does not exist yet"),
            Err(e) => debug!(error = %e, "Failed to get service"),
        }
        if Instant::now() + DISCOVERY_POLL_INTERVAL > deadline {
            return false;
        }
        tokio::time::sleep(DISCOVERY_POLL_INTERVAL).await;
    }
}

/// Wait until two consecutive polls see the same non-empty endpoint set
///
/// The first node of a cluster takes whatever it sees on the first poll.
async fn wait_for_endpoints(
    api: &Api<Endpoints>,
    options: &DiscoverOptions,
    first_node: bool,
) -> Option<Vec<String>> {
    let deadline = Instant::now() + options.timeout;
    let mut last: Option<Vec<String>> = None;

    loop {
        match api.get_opt(&options.service).await {
            Ok(Some(endpoints)) => {
                let hosts = endpoint_hosts(&endpoints, &options.service, &options.namespace);
                debug!(hosts = ?hosts, "Found endpoints");
                let stable = !hosts.is_empty()
                    && last.as_ref().is_some_and(|prev| prev.len() == hosts.len());
                if stable || first_node {
                    return Some(hosts);
                }
                last = Some(hosts);
            }
            Ok(None) => debug!(service = %options.service, "Endpoints do not exist yet"),
            Err(e) => debug!(error = %e, "Failed to get endpoints"),
        }

        if Instant::now() + DISCOVERY_POLL_INTERVAL > deadline {
            return last;
        }
        tokio::time::sleep(DISCOVERY_POLL_INTERVAL).await;
    }
}
