use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};

use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::EventType;

use crate::admission::{AdmissionGuard, KubeLookup, PlatformLookup};
use crate::config::OperatorConfig;
use crate::controller::events::{EventPublisher, KubeEventPublisher};
use crate::controller::scheduler::BackupScheduler;
use crate::controller::state_machine::DatabaseStateMachine;
use crate::health::HealthState;
use crate::storage::{ObjectStorage, SnapshotStorage};

/// Name events are reported under
pub const CONTROLLER_NAME: &str = "elasticsearch-operator";

/// Shared context for the controllers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Operator options from the command line
    pub config: OperatorConfig,
    /// Cron registry for backup schedules
    pub scheduler: Arc<BackupScheduler>,
    /// Object storage used for bucket checks and wipe-out
    pub storage: Arc<dyn SnapshotStorage>,
    /// Cluster lookups for the admission guard
    pub lookup: Arc<dyn PlatformLookup>,
    pub events: Arc<dyn EventPublisher>,
    pub state_machine: Arc<DatabaseStateMachine>,
    /// Metrics sink, absent in tests
    pub health_state: Option<Arc<HealthState>>,
    /// Consecutive failures per object, drives the error backoff
    attempts: Arc<Mutex<HashMap<String, u32>>>,
}

impl Context {
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        let storage: Arc<dyn SnapshotStorage> = Arc::new(ObjectStorage::new(client.clone()));
        let lookup = Arc::new(KubeLookup::new(client.clone(), Arc::clone(&storage)));
        let events = Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));

        Self {
            client,
            config,
            scheduler: Arc::new(BackupScheduler::new()),
            storage,
            lookup,
            events,
            state_machine: Arc::new(DatabaseStateMachine::new()),
            health_state: None,
            attempts: Arc::default(),
        }
    }

    pub fn with_health_state(mut self, health_state: Arc<HealthState>) -> Self {
        self.health_state = Some(health_state);
        self
    }

    /// Admission guard backed by this context's lookups
    pub fn guard(&self) -> AdmissionGuard<'_> {
        AdmissionGuard::new(self.lookup.as_ref())
    }

    pub async fn publish_normal(&self, obj: &ObjectReference, reason: &str, action: &str, note: String) {
        self.events
            .publish(obj, EventType::Normal, reason, action, Some(note))
            .await;
    }

    pub async fn publish_warning(&self, obj: &ObjectReference, reason: &str, action: &str, note: String) {
        self.events
            .publish(obj, EventType::Warning, reason, action, Some(note))
            .await;
    }

    /// Bump and return the failure count for `key`, starting at zero
    pub fn next_attempt(&self, key: &str) -> u32 {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = attempts.entry(key.to_string()).or_insert(0);
        let attempt = *count;
        *count = count.saturating_add(1);
        attempt
    }

    pub fn reset_attempts(&self, key: &str) {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Record a reconcile outcome in the metrics, if enabled
    pub fn record_reconcile(&self, kind: &str, namespace: &str, name: &str, secs: f64, ok: bool) {
        if let Some(health) = &self.health_state {
            if ok {
                health.metrics.record_reconcile(kind, namespace, name, secs);
                health
                    .last_reconcile
                    .store(chrono::Utc::now().timestamp().max(0) as u64, Ordering::Relaxed);
            } else {
                health.metrics.record_error(kind, namespace, name);
            }
        }
    }
}
