//! Kubernetes Event recording
//!
//! Events are fire-and-forget: a failed publish is logged and never fails
//! a reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

/// Publishes Kubernetes Events about operator-managed objects
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons (REASON column of `kubectl get events`)
pub mod reasons {
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    pub const CREATING: &str = "Creating";
    pub const SUCCESSFUL_CREATE: &str = "SuccessfulCreate";
    pub const SUCCESSFUL_PATCH: &str = "SuccessfulPatch";
    pub const SCALED: &str = "Scaled";
    pub const DATABASE_RUNNING: &str = "DatabaseRunning";
    pub const DATABASE_FAILED: &str = "DatabaseFailed";
    pub const RESUMED: &str = "Resumed";
    pub const INITIALIZING: &str = "Initializing";
    pub const RESTORE_SUCCEEDED: &str = "RestoreSucceeded";
    pub const RESTORE_FAILED: &str = "RestoreFailed";
    pub const SCHEDULE_REGISTERED: &str = "BackupScheduleRegistered";
    pub const SCHEDULE_REMOVED: &str = "BackupScheduleRemoved";
    pub const PAUSED: &str = "Paused";
    pub const DELETED: &str = "Deleted";
    pub const WIPED_OUT: &str = "WipedOut";
    pub const DO_NOT_TERMINATE: &str = "DoNotTerminate";
    pub const SNAPSHOT_STARTED: &str = "SnapshotStarted";
    pub const SNAPSHOT_SUCCEEDED: &str = "SnapshotSucceeded";
    pub const SNAPSHOT_FAILED: &str = "SnapshotFailed";
}

/// Event actions (ACTION column of `kubectl get events`)
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const CREATE: &str = "Create";
    pub const SCALE: &str = "Scale";
    pub const SCHEDULE: &str = "Schedule";
    pub const DELETE: &str = "Delete";
    pub const BACKUP: &str = "Backup";
    pub const RESTORE: &str = "Restore";
    pub const RESUME: &str = "Resume";
    pub const WIPE_OUT: &str = "WipeOut";
}
