use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use elasticsearch_operator::config::{OperatorConfig, kube_client, operator_namespace};
use elasticsearch_operator::discover::{DEFAULT_OUTPUT, DiscoverOptions, run_discover};
use elasticsearch_operator::health::{HealthState, run_health_server};
use elasticsearch_operator::{
    Context, WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WebhookState, crds_yaml, run_controllers,
    run_webhook_server,
};

/// Lease configuration
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

/// Grace period for in-flight reconciliations to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

const DEFAULT_LOG_DIRECTIVES: &str =
    "elasticsearch_operator=info,kube=info,kube_leader_election=info";

#[derive(Parser, Debug)]
#[command(name = "elasticsearch-operator", version, about)]
struct Cli {
    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the operator
    Run(RunArgs),
    /// Write the unicast hosts file for a database pod
    Discover(DiscoverArgs),
    /// Print the CRD manifests
    Crd,
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// Kubernetes API server address, overriding the kubeconfig
    #[arg(long, env = "KUBE_MASTER")]
    master: Option<String>,

    /// Path to a kubeconfig file
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    client: ClientArgs,

    /// Governing service and service account of database StatefulSets
    #[arg(long, env = "GOVERNING_SERVICE", default_value = "kubedb")]
    governing_service: String,

    /// Registry for database, exporter and backup images
    #[arg(long, env = "DOCKER_REGISTRY", default_value = "kubedb")]
    docker_registry: String,

    /// Tag of the metrics exporter image
    #[arg(long, env = "EXPORTER_TAG", default_value = "1.0.2")]
    exporter_tag: String,

    /// Database image, overriding `<registry>/elasticsearch:<version>`
    #[arg(long, env = "ELASTICSEARCH_IMAGE")]
    elasticsearch_image: Option<String>,

    /// Health and metrics listen address
    #[arg(long, env = "ADDRESS", default_value = "0.0.0.0:8080")]
    address: SocketAddr,

    /// Admission webhook listen address
    #[arg(long, env = "WEBHOOK_ADDRESS", default_value = "0.0.0.0:8443")]
    webhook_address: SocketAddr,

    #[arg(long, env = "WEBHOOK_CERT", default_value = WEBHOOK_CERT_PATH)]
    webhook_cert: PathBuf,

    #[arg(long, env = "WEBHOOK_KEY", default_value = WEBHOOK_KEY_PATH)]
    webhook_key: PathBuf,

    /// Namespace to watch; empty watches every namespace
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    #[arg(long, env = "RESYNC_PERIOD_SECS", default_value_t = 300)]
    resync_period_secs: u64,

    /// Bound on waiting for database pods to become ready
    #[arg(long, env = "READY_TIMEOUT_SECS", default_value_t = 600)]
    ready_timeout_secs: u64,

    /// Bound on backup and restore jobs
    #[arg(long, env = "JOB_TIMEOUT_SECS", default_value_t = 1800)]
    job_timeout_secs: u64,

    #[arg(long, env = "LEADER_ELECTION", default_value_t = true, action = clap::ArgAction::Set)]
    leader_election: bool,

    #[arg(long, env = "LEASE_NAME", default_value = "elasticsearch-operator-leader")]
    lease_name: String,
}

impl RunArgs {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            governing_service: self.governing_service.clone(),
            docker_registry: self.docker_registry.clone(),
            exporter_tag: self.exporter_tag.clone(),
            elasticsearch_image: self.elasticsearch_image.clone().filter(|i| !i.is_empty()),
            watch_namespace: Some(self.namespace.clone()).filter(|ns| !ns.is_empty()),
            operator_namespace: operator_namespace(),
            resync_period: Duration::from_secs(self.resync_period_secs),
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
            job_timeout: Duration::from_secs(self.job_timeout_secs),
        }
    }
}

#[derive(Args, Debug)]
struct DiscoverArgs {
    #[command(flatten)]
    client: ClientArgs,

    #[arg(long, env = "NAMESPACE", default_value = "default")]
    namespace: String,

    /// Governing service of the database
    #[arg(long, env = "SERVICE")]
    service: String,

    #[arg(long, default_value = DEFAULT_OUTPUT)]
    output: PathBuf,

    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Discover(args) => discover(args).await,
        Command::Crd => {
            print!("{}", crds_yaml()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVES));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Name this process holds leases under
fn pod_name() -> String {
    std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    })
}

async fn discover(args: DiscoverArgs) -> Result<(), Box<dyn std::error::Error>> {
    let client = kube_client(args.client.master.as_deref(), args.client.kubeconfig.as_deref()).await?;
    let options = DiscoverOptions {
        namespace: args.namespace,
        service: args.service,
        output: args.output,
        timeout: Duration::from_secs(args.timeout_secs),
        pod_name: Some(pod_name()),
    };
    run_discover(client, &options).await?;
    Ok(())
}

async fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Install the TLS crypto provider before any TLS operations
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err("Failed to install rustls crypto provider and no provider is available".into());
    }

    info!("Starting elasticsearch-operator");

    let config = args.operator_config();
    let client = kube_client(args.client.master.as_deref(), args.client.kubeconfig.as_deref()).await?;
    info!("Connected to Kubernetes cluster");

    let health_state = Arc::new(HealthState::new());
    let ctx = Arc::new(Context::new(client.clone(), config.clone()).with_health_state(Arc::clone(&health_state)));

    // Probes must answer even while not leader
    let health_handle = {
        let health_state = Arc::clone(&health_state);
        let addr = args.address;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, addr).await {
                error!("Health server error: {}", e);
            }
        })
    };

    // Admission requests are served by every replica
    let webhook_handle = if args.webhook_cert.exists() && args.webhook_key.exists() {
        info!("TLS certificates found, starting webhook server");
        let state = Arc::new(WebhookState::new(Arc::clone(&ctx.lookup)));
        let (addr, cert, key) = (args.webhook_address, args.webhook_cert.clone(), args.webhook_key.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = run_webhook_server(state, addr, &cert, &key).await {
                error!("Webhook server error: {}", e);
            }
        }))
    } else {
        info!(
            "TLS certificates not found at {} and {}, webhook server disabled",
            args.webhook_cert.display(),
            args.webhook_key.display()
        );
        None
    };

    let lease_renewal_handle = if args.leader_election {
        let holder_id = pod_name();
        let lease_params = LeaseLockParams {
            holder_id,
            lease_name: args.lease_name.clone(),
            lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
        };
        info!(
            holder_id = %lease_params.holder_id,
            namespace = %config.operator_namespace,
            lease_name = %args.lease_name,
            "Initializing leader election"
        );
        let lease_lock = LeaseLock::new(client.clone(), &config.operator_namespace, lease_params);

        tokio::select! {
            _ = acquire_leadership(&lease_lock) => {}
            _ = shutdown_signal() => {
                info!("Received shutdown signal before acquiring leadership");
                return Ok(());
            }
        }
        Some(tokio::spawn(renew_leadership(lease_lock)))
    } else {
        warn!("Leader election disabled, running as the only instance");
        None
    };

    health_state.set_ready(true).await;
    info!(
        "Watching Elasticsearch, DormantDatabase and Snapshot resources (apiVersion: elasticsearch-operator.smoketurner.com/v1alpha1)"
    );
    let controller_handle = tokio::spawn(run_controllers(Arc::clone(&ctx)));

    let webhook_future = async {
        match webhook_handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!("Webhook server task panicked: {}", e);
                }
            }
            None => std::future::pending::<()>().await,
        }
    };
    let lease_future = async {
        match lease_renewal_handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!("Lease renewal task panicked: {}", e);
                }
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = controller_handle => {
            if let Err(e) = result {
                error!("Controller task panicked: {}", e);
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        _ = webhook_future => {}
        _ = lease_future => {}
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");
        }
    }

    health_state.set_ready(false).await;
    info!("Marked operator as not ready");
    ctx.scheduler.shutdown();

    info!(
        "Waiting {}s for in-flight reconciliations to complete...",
        SHUTDOWN_GRACE_PERIOD_SECS
    );
    tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;

    info!("Operator stopped");
    Ok(())
}

async fn acquire_leadership(lease_lock: &LeaseLock) {
    info!("Waiting to acquire leadership...");
    loop {
        match lease_lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("Acquired leadership");
                return;
            }
            Ok(_) => info!("Another instance is leader, waiting..."),
            Err(e) => warn!("Failed to acquire lease: {}, retrying...", e),
        }
        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
    }
}

/// Renew the lease until it is lost, then exit so the pod restarts into the election
async fn renew_leadership(lease_lock: LeaseLock) {
    loop {
        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;

        match lease_lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {}
            Ok(_) => {
                error!("Lost leadership! Shutting down...");
                std::process::exit(1);
            }
            Err(e) => {
                error!("Failed to renew lease: {}. Shutting down...", e);
                std::process::exit(1);
            }
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
