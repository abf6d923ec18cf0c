//! Status and conditions management for Elasticsearch resources
//!
//! Status construction is kept pure (`next_status`) so phase bookkeeping can
//! be tested without a cluster; `StatusManager` only adds the patch call.

use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};

use crate::controller::Context;
use crate::controller::error::Result;
use crate::crd::{Condition, DatabasePhase, Elasticsearch, ElasticsearchStatus};
use crate::resources::FIELD_MANAGER;

/// Standard condition types following Kubernetes conventions
pub mod condition_types {
    /// All node groups have their desired pods ready
    pub const READY: &str = "Ready";
    /// Workloads are being created, restored or torn down
    pub const PROGRESSING: &str = "Progressing";
    /// The spec passed the admission guard
    pub const CONFIG_VALID: &str = "ConfigurationValid";
    /// The database was initialized from its snapshot source
    pub const RESTORED: &str = "Restored";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
}

fn bool_status(value: bool) -> &'static str {
    if value {
        condition_status::TRUE
    } else {
        condition_status::FALSE
    }
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    pub fn new(generation: Option<i64>) -> Self {
        Self {
            conditions: Vec::new(),
            generation,
        }
    }

    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't
    ///
    /// `lastTransitionTime` only moves when the status value changes.
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        let now = Utc::now().to_rfc3339();

        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = now;
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: now,
                observed_generation: self.generation,
            });
        }
        self
    }

    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::READY, bool_status(is_ready), reason, message)
    }

    pub fn progressing(self, is_progressing: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::PROGRESSING,
            bool_status(is_progressing),
            reason,
            message,
        )
    }

    pub fn config_valid(self, is_valid: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::CONFIG_VALID,
            bool_status(is_valid),
            reason,
            message,
        )
    }

    pub fn restored(self, is_restored: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::RESTORED,
            bool_status(is_restored),
            reason,
            message,
        )
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Timestamp for a phase: kept while the phase is unchanged, reset on entry
pub fn phase_started_at(db: &Elasticsearch, new_phase: DatabasePhase) -> Option<String> {
    let status = db.status.as_ref();
    let existing = status.and_then(|s| s.phase_started_at.clone());

    if status.map(|s| s.phase) == Some(new_phase) && existing.is_some() {
        existing
    } else {
        Some(Utc::now().to_rfc3339())
    }
}

/// Seconds spent in the current phase, `None` when never recorded
pub fn seconds_in_phase(db: &Elasticsearch) -> Option<i64> {
    let started = db.status.as_ref()?.phase_started_at.as_deref()?;
    let started = chrono::DateTime::parse_from_rfc3339(started).ok()?;
    Some((Utc::now() - started.with_timezone(&Utc)).num_seconds())
}

/// Build the status for entering (or staying in) a phase
///
/// Conditions are derived from the phase so every writer produces the same
/// shape. Replica counts fall back to the previous status when `None`.
pub fn next_status(
    db: &Elasticsearch,
    phase: DatabasePhase,
    reason: Option<&str>,
    replicas: Option<(i32, i32)>,
) -> ElasticsearchStatus {
    let generation = db.metadata.generation;
    let previous = db.status.clone().unwrap_or_default();
    let message = reason.unwrap_or_default();

    let builder = ConditionBuilder::from_existing(previous.conditions.clone(), generation);
    let builder = match phase {
        DatabasePhase::Pending => builder.progressing(false, "Pending", "Waiting for reconcile"),
        DatabasePhase::Creating => builder
            .config_valid(true, "Validated", "Spec passed validation")
            .ready(false, "Creating", "Workloads are being created")
            .progressing(true, "CreatingWorkloads", "Creating workloads"),
        DatabasePhase::Initializing => builder
            .ready(false, "Initializing", "Restoring from snapshot")
            .progressing(true, "Restoring", "Restore job is running")
            .restored(false, "Restoring", "Restore job is running"),
        DatabasePhase::Running => {
            let builder = builder
                .config_valid(true, "Validated", "Spec passed validation")
                .ready(true, "DatabaseReady", "All node groups are ready")
                .progressing(false, "Stable", "Database is stable");
            if db.snapshot_source().is_some() {
                builder.restored(true, "RestoreSucceeded", "Restored from snapshot")
            } else {
                builder
            }
        }
        DatabasePhase::Failed => {
            let builder = builder
                .ready(false, "Failed", message)
                .progressing(false, "Failed", message);
            if message.starts_with("Validation") {
                builder.config_valid(false, "ValidationFailed", message)
            } else {
                builder
            }
        }
        DatabasePhase::Deleting => builder
            .ready(false, "Deleting", "Database is being deleted")
            .progressing(true, "Terminating", "Applying termination policy"),
        DatabasePhase::Paused | DatabasePhase::Deleted | DatabasePhase::WipedOut => builder
            .ready(false, "Terminated", "Database was deleted")
            .progressing(false, "Terminated", "Termination policy applied"),
    };

    let (ready_replicas, replicas) =
        replicas.unwrap_or((previous.ready_replicas, previous.replicas));

    ElasticsearchStatus {
        phase,
        reason: reason.map(str::to_string),
        replicas,
        ready_replicas,
        observed_generation: generation,
        conditions: builder.build(),
        phase_started_at: phase_started_at(db, phase),
    }
}

/// Status writer for one Elasticsearch object
pub struct StatusManager<'a> {
    db: &'a Elasticsearch,
    ctx: &'a Context,
    ns: &'a str,
}

impl<'a> StatusManager<'a> {
    pub fn new(db: &'a Elasticsearch, ctx: &'a Context, ns: &'a str) -> Self {
        Self { db, ctx, ns }
    }

    /// Write a full status object
    pub async fn update(&self, status: ElasticsearchStatus) -> Result<()> {
        let api: Api<Elasticsearch> = Api::namespaced(self.ctx.client.clone(), self.ns);
        let patch = serde_json::json!({ "status": status });

        api.patch_status(
            &self.db.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;

        if let Some(health) = &self.ctx.health_state
            && self.db.phase() != status.phase
        {
            health.metrics.record_phase_change(self.db.phase(), status.phase);
        }
        Ok(())
    }
}

/// Check if the spec has changed by comparing observed generation
pub fn spec_changed(db: &Elasticsearch) -> bool {
    let current_generation = db.metadata.generation;
    let observed_generation = db.status.as_ref().and_then(|s| s.observed_generation);

    match (current_generation, observed_generation) {
        (Some(current), Some(observed)) => current != observed,
        _ => true,
    }
}
