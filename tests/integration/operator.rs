//! Operator spawning utilities for integration tests
//!
//! Each test gets its own operator instance, watching only the test
//! namespace, running in the test's tokio runtime.

use elasticsearch_operator::config::OperatorConfig;
use elasticsearch_operator::{Context, run_controllers};
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A scoped operator that runs for the duration of a test
pub struct ScopedOperator {
    handle: JoinHandle<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    ctx: Arc<Context>,
}

impl ScopedOperator {
    /// Start the Elasticsearch, DormantDatabase and Snapshot controllers
    ///
    /// Timeouts are shortened so failure paths surface within a test run.
    pub async fn start(client: Client, namespace: &str) -> Self {
        let config = OperatorConfig {
            watch_namespace: Some(namespace.to_string()),
            ready_timeout: Duration::from_secs(180),
            job_timeout: Duration::from_secs(300),
            resync_period: Duration::from_secs(30),
            ..Default::default()
        };
        let ctx = Arc::new(Context::new(client, config));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tracing::info!("Starting scoped operator for namespace {}", namespace);

        let controllers = Arc::clone(&ctx);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = run_controllers(controllers) => {
                    tracing::debug!("Operator exited normally");
                }
                _ = shutdown_rx => {
                    tracing::debug!("Operator received shutdown signal");
                }
            }
        });

        // Give the controllers a moment to start watching
        tokio::time::sleep(Duration::from_millis(100)).await;

        Self {
            handle,
            shutdown_tx: Some(shutdown_tx),
            ctx,
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }
}

impl Drop for ScopedOperator {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.ctx.scheduler.shutdown();
        self.handle.abort();
    }
}
