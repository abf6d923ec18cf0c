pub mod admission;
pub mod config;
pub mod controller;
pub mod crd;
pub mod discover;
pub mod health;
pub mod resources;
pub mod storage;
pub mod webhooks;

pub use config::OperatorConfig;
pub use controller::{
    BackoffConfig, Context, Error, FINALIZER, Result, error_policy, reconcile,
    reconcile_dormant, reconcile_snapshot,
};
pub use crd::{DormantDatabase, Elasticsearch, Snapshot};
pub use health::{HealthState, Metrics};
pub use webhooks::{
    WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT, WebhookError, WebhookState,
    run_webhook_server,
};

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::Controller;
use kube::runtime::controller::{self as runtime_controller, Action};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::{Api, Client, CustomResourceExt, Resource};
use serde::de::DeserializeOwned;

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Ticks every `period`, starting one period from now
///
/// Drives the periodic full resync of a controller.
pub fn resync_trigger(period: Duration) -> impl Stream<Item = ()> + Send + Sync + 'static {
    let (tx, rx) = mpsc::unbounded();
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        loop {
            ticker.tick().await;
            if tx.unbounded_send(()).is_err() {
                return;
            }
        }
    });
    rx
}

/// Log the outcome of one reconcile
async fn log_result<K: Resource>(
    kind: &'static str,
    result: std::result::Result<(ObjectRef<K>, Action), runtime_controller::Error<Error, watcher::Error>>,
) {
    match result {
        Ok((obj, _action)) => {
            tracing::debug!("Reconciled {}: {}", kind, obj.name);
        }
        Err(e) => {
            // Watch events for deleted objects land here after deletion
            let is_not_found = matches!(
                &e,
                runtime_controller::Error::ReconcilerFailed(err, _) if err.is_not_found()
            );
            if is_not_found {
                tracing::debug!("{} no longer exists (likely deleted): {:?}", kind, e);
            } else {
                tracing::error!("{} reconciliation error: {:?}", kind, e);
            }
        }
    }
}

/// Run the Elasticsearch, DormantDatabase and Snapshot controllers
///
/// Watches `ctx.config.watch_namespace`, or every namespace when unset.
/// Returns once all three controllers stop on SIGINT/SIGTERM.
pub async fn run_controllers(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    let namespace = ctx.config.watch_namespace.as_deref();
    let resync = ctx.config.resync_period;
    let scope_msg = namespace.unwrap_or("cluster-wide");

    tracing::info!(
        "Starting controllers for Elasticsearch, DormantDatabase and Snapshot resources (scope: {})",
        scope_msg
    );

    // any_semantic() keeps discovery of new objects reliable
    let watcher_config = WatcherConfig::default().any_semantic();

    let databases = Controller::new(
        scoped_api::<Elasticsearch>(client.clone(), namespace),
        watcher_config.clone(),
    )
    .owns(scoped_api::<StatefulSet>(client.clone(), namespace), watcher_config.clone())
    .owns(scoped_api::<Service>(client.clone(), namespace), watcher_config.clone())
    .owns(scoped_api::<Job>(client.clone(), namespace), watcher_config.clone())
    .reconcile_all_on(resync_trigger(resync))
    .shutdown_on_signal()
    .run(reconcile, error_policy, Arc::clone(&ctx))
    .for_each(|result| log_result("Elasticsearch", result));

    let dormant = Controller::new(
        scoped_api::<DormantDatabase>(client.clone(), namespace),
        watcher_config.clone(),
    )
    .reconcile_all_on(resync_trigger(resync))
    .shutdown_on_signal()
    .run(reconcile_dormant, error_policy, Arc::clone(&ctx))
    .for_each(|result| log_result("DormantDatabase", result));

    let snapshots = Controller::new(
        scoped_api::<Snapshot>(client.clone(), namespace),
        watcher_config.clone(),
    )
    .owns(scoped_api::<Job>(client, namespace), watcher_config)
    .reconcile_all_on(resync_trigger(resync))
    .shutdown_on_signal()
    .run(reconcile_snapshot, error_policy, Arc::clone(&ctx))
    .for_each(|result| log_result("Snapshot", result));

    futures::join!(databases, dormant, snapshots);
    tracing::info!("Controllers stopped");
}

/// The three CRD manifests as a multi-document YAML stream
pub fn crds_yaml() -> std::result::Result<String, serde_yaml::Error> {
    let documents = [
        serde_yaml::to_string(&Elasticsearch::crd())?,
        serde_yaml::to_string(&DormantDatabase::crd())?,
        serde_yaml::to_string(&Snapshot::crd())?,
    ];
    Ok(documents.join("---\n"))
}
