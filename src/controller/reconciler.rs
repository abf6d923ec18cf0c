//! Reconciliation logic for Elasticsearch resources
//!
//! Drives a database through `Pending → Creating → Initializing? → Running`
//! and applies the termination policy once the deletion timestamp is set.
//! Every phase change goes through the [`DatabaseStateMachine`] table.
//!
//! [`DatabaseStateMachine`]: crate::controller::state_machine::DatabaseStateMachine

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::dormant::pause_database;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::events::{actions, reasons};
use crate::controller::materializer::{Materializer, READY_POLL_INTERVAL};
use crate::controller::scheduler::{backup_job, fingerprint, schedule_key};
use crate::controller::snapshot::{
    JOB_POLL_INTERVAL, RestoreProgress, cleanup_restore, ensure_restore,
};
use crate::controller::state_machine::{
    DatabaseEvent, TransitionContext, TransitionResult, determine_event,
};
use crate::controller::status::{StatusManager, next_status, seconds_in_phase, spec_changed};
use crate::controller::teardown;
use crate::crd::{DatabasePhase, DormantDatabase, Elasticsearch, TerminationPolicy};
use crate::resources::common::FIELD_MANAGER;

/// Finalizer held until the termination policy has been applied
pub const FINALIZER: &str = "elasticsearch-operator.smoketurner.com/finalizer";

/// Requeue interval for a Running database
const STEADY_STATE_REQUEUE: Duration = Duration::from_secs(30);

/// Main reconciliation function
#[instrument(skip(db, ctx), fields(name = %db.name_any(), namespace = db.namespace().unwrap_or_default()))]
pub async fn reconcile(db: Arc<Elasticsearch>, ctx: Arc<Context>) -> Result<Action> {
    let ns = db.namespace().unwrap_or_default();
    let name = db.name_any();
    let started = Instant::now();

    let result = reconcile_database(&db, &ctx, &ns).await;
    ctx.record_reconcile(
        "Elasticsearch",
        &ns,
        &name,
        started.elapsed().as_secs_f64(),
        result.is_ok(),
    );

    match &result {
        Ok(_) => ctx.reset_attempts(&attempt_key(db.as_ref())),
        Err(e) => {
            error!("Reconciliation failed: {}", e);
            // Keep the phase, surface the reason once
            let message = e.to_string();
            let recorded = db.status.as_ref().and_then(|s| s.reason.as_deref());
            if db.metadata.deletion_timestamp.is_none() && recorded != Some(message.as_str()) {
                let status = next_status(&db, db.phase(), Some(&message), None);
                let _ = StatusManager::new(&db, &ctx, &ns).update(status).await;
            }
            ctx.publish_warning(
                &db.object_ref(&()),
                e.reason(),
                actions::RECONCILE,
                message,
            )
            .await;
        }
    }
    result
}

/// Error policy shared by all controllers: exponential backoff per object
pub fn error_policy<K>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    let name = obj.name_any();
    let attempt = ctx.next_attempt(&attempt_key(obj.as_ref()));
    let delay = BackoffConfig::default().delay_for_error(error, attempt);

    if error.is_retryable() {
        warn!(
            "Retryable error for {}: {:?}, requeuing in {:?}",
            name, error, delay
        );
    } else {
        error!(
            "Non-retryable error for {}: {:?}, requeuing in {:?} for manual intervention",
            name, error, delay
        );
    }

    Action::requeue(delay)
}

fn attempt_key<K: Resource<DynamicType = ()>>(obj: &K) -> String {
    format!(
        "{}/{}/{}",
        K::kind(&()),
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    )
}

async fn reconcile_database(db: &Elasticsearch, ctx: &Context, ns: &str) -> Result<Action> {
    if db.metadata.deletion_timestamp.is_some() {
        return handle_deletion(db, ctx, ns).await;
    }

    if !has_finalizer(db) {
        add_finalizer(db, ctx, ns).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let mut db = db.clone();
    match db.phase() {
        DatabasePhase::Initializing => restore(&mut db, ctx, ns).await,
        phase if phase.is_deletion_outcome() => {
            debug!(%phase, "Termination already applied");
            Ok(Action::await_change())
        }
        _ => converge(&mut db, ctx, ns).await,
    }
}

/// Apply `event` through the state machine and write the resulting status
///
/// `db.status` is refreshed in place so later steps of the same reconcile
/// see the new phase. Returns the phase entered, if any.
async fn apply_event(
    db: &mut Elasticsearch,
    ctx: &Context,
    ns: &str,
    event: DatabaseEvent,
    tctx: &TransitionContext,
    reason: Option<&str>,
    replicas: Option<(i32, i32)>,
) -> Result<Option<DatabasePhase>> {
    let current = db.phase();
    match ctx.state_machine.transition(&current, event, tctx) {
        TransitionResult::Success {
            to, description, ..
        } => {
            info!(from = %current, to = %to, event = %event, "{}", description);
            let status = next_status(db, to, reason, replicas);
            StatusManager::new(db, ctx, ns).update(status.clone()).await?;
            db.status = Some(status);
            Ok(Some(to))
        }
        TransitionResult::GuardFailed { reason, .. } => {
            debug!(from = %current, event = %event, "Transition guard failed: {}", reason);
            Ok(None)
        }
        TransitionResult::InvalidTransition { .. } => {
            warn!(from = %current, event = %event, "Invalid transition");
            Ok(None)
        }
    }
}

/// Record a failure, entering Failed when the table allows it
async fn fail(
    db: &mut Elasticsearch,
    ctx: &Context,
    ns: &str,
    event: DatabaseEvent,
    reason: &str,
) -> Result<Action> {
    let entered = apply_event(db, ctx, ns, event, &TransitionContext::default(), Some(reason), None)
        .await?;
    if entered.is_none() && db.phase() == DatabasePhase::Failed {
        // Still failing after a spec change: refresh reason and generation
        let status = next_status(db, DatabasePhase::Failed, Some(reason), None);
        StatusManager::new(db, ctx, ns).update(status).await?;
    }

    ctx.publish_warning(
        &db.object_ref(&()),
        reasons::DATABASE_FAILED,
        actions::RECONCILE,
        reason.to_string(),
    )
    .await;
    Ok(Action::await_change())
}

/// Validate, materialize and advance a live database
async fn converge(db: &mut Elasticsearch, ctx: &Context, ns: &str) -> Result<Action> {
    let name = db.name_any();
    let is_spec_changed = spec_changed(db);
    let phase = db.phase();

    if phase == DatabasePhase::Failed && !is_spec_changed {
        debug!("Failed and spec unchanged, waiting for an update");
        return Ok(Action::await_change());
    }

    // A recoverable DormantDatabase turns this create into a resume
    let dormant = ctx.lookup.dormant_database(ns, &name).await?;
    let resuming = dormant.as_ref().is_some_and(|d| d.phase().is_recoverable());

    if is_spec_changed || phase == DatabasePhase::Pending {
        info!(
            "Spec changed for {} (generation: {:?} -> {:?}), validating",
            name,
            db.status.as_ref().and_then(|s| s.observed_generation),
            db.metadata.generation
        );
        match ctx.guard().validate(db).await {
            Ok(()) => {}
            Err(Error::ValidationError(message)) => {
                ctx.publish_warning(
                    &db.object_ref(&()),
                    reasons::VALIDATION_FAILED,
                    actions::RECONCILE,
                    message.clone(),
                )
                .await;
                let reason = format!("Validation failed: {}", message);
                return fail(db, ctx, ns, DatabaseEvent::ValidationFailed, &reason).await;
            }
            Err(e) => return Err(e),
        }
    }

    let total = db.spec.shape.total_replicas();
    match phase {
        DatabasePhase::Pending => {
            apply_event(
                db,
                ctx,
                ns,
                DatabaseEvent::ValidationPassed,
                &TransitionContext::default(),
                None,
                Some((0, total)),
            )
            .await?;
            ctx.publish_normal(
                &db.object_ref(&()),
                reasons::CREATING,
                actions::CREATE,
                format!("Creating Elasticsearch {} ({} pods)", name, total),
            )
            .await;
        }
        DatabasePhase::Failed => {
            let tctx = TransitionContext::default().with_spec_changed(true);
            apply_event(db, ctx, ns, DatabaseEvent::SpecChanged, &tctx, None, Some((0, total)))
                .await?;
        }
        _ => {}
    }

    let changed = match Materializer::new(ctx, db).materialize().await {
        Ok(changed) => changed,
        Err(Error::ConflictError(message)) if db.phase() == DatabasePhase::Creating => {
            return fail(db, ctx, ns, DatabaseEvent::ValidationFailed, &message).await;
        }
        Err(e) => return Err(e),
    };

    let (ready, desired) = if changed || db.phase() == DatabasePhase::Creating {
        let waited = Materializer::new(ctx, db)
            .wait_ready(ctx.config.ready_timeout)
            .await;
        match waited {
            Ok(counts) => counts,
            Err(e @ Error::ConvergenceTimeout { .. }) => {
                let reason = e.to_string();
                return fail(db, ctx, ns, DatabaseEvent::ConvergenceTimedOut, &reason).await;
            }
            Err(e) => return Err(e),
        }
    } else {
        Materializer::new(ctx, db).readiness().await?
    };

    let restore_required = db.snapshot_source().is_some() && !resuming;
    let tctx = TransitionContext::new(ready, desired)
        .with_restore(restore_required)
        .with_spec_changed(is_spec_changed);

    match determine_event(&db.phase(), &tctx, false) {
        Some(DatabaseEvent::RestoreRequired) => {
            apply_event(db, ctx, ns, DatabaseEvent::RestoreRequired, &tctx, None, Some((ready, desired)))
                .await?;
            ctx.publish_normal(
                &db.object_ref(&()),
                reasons::INITIALIZING,
                actions::RESTORE,
                "Restoring from snapshot".to_string(),
            )
            .await;
            return Ok(Action::requeue(JOB_POLL_INTERVAL));
        }
        Some(DatabaseEvent::WorkloadsReady) => {
            apply_event(db, ctx, ns, DatabaseEvent::WorkloadsReady, &tctx, None, Some((ready, desired)))
                .await?;
            ctx.publish_normal(
                &db.object_ref(&()),
                reasons::DATABASE_RUNNING,
                actions::RECONCILE,
                format!("Elasticsearch {} is running", name),
            )
            .await;
        }
        _ => {}
    }

    if db.phase() != DatabasePhase::Running {
        return Ok(Action::requeue(READY_POLL_INTERVAL));
    }

    refresh_running(db, ctx, ns, ready, desired).await?;
    if resuming && let Some(dormant) = dormant {
        finish_resume(db, ctx, ns, &dormant).await?;
    }
    sync_schedule(db, ctx, ns).await?;

    Ok(Action::requeue(STEADY_STATE_REQUEUE))
}

/// Keep replica counts and observed generation current without a phase change
async fn refresh_running(
    db: &mut Elasticsearch,
    ctx: &Context,
    ns: &str,
    ready: i32,
    desired: i32,
) -> Result<()> {
    let current = db.status.clone().unwrap_or_default();
    let stale = current.ready_replicas != ready
        || current.replicas != desired
        || current.observed_generation != db.metadata.generation
        || current.reason.is_some();
    if !stale {
        return Ok(());
    }

    let status = next_status(db, DatabasePhase::Running, None, Some((ready, desired)));
    StatusManager::new(db, ctx, ns).update(status.clone()).await?;
    db.status = Some(status);
    Ok(())
}

/// Drive the restore job while Initializing
async fn restore(db: &mut Elasticsearch, ctx: &Context, ns: &str) -> Result<Action> {
    let job_timeout = ctx.config.job_timeout.as_secs() as i64;
    if seconds_in_phase(db).is_some_and(|secs| secs > job_timeout) {
        let reason = format!(
            "ConvergenceTimeout: restore did not finish within {:?}",
            ctx.config.job_timeout
        );
        cleanup_restore(ctx, ns, &db.name_any()).await?;
        ctx.publish_warning(
            &db.object_ref(&()),
            reasons::RESTORE_FAILED,
            actions::RESTORE,
            reason.clone(),
        )
        .await;
        return fail(db, ctx, ns, DatabaseEvent::ConvergenceTimedOut, &reason).await;
    }

    match ensure_restore(ctx, db).await? {
        RestoreProgress::Running => Ok(Action::requeue(JOB_POLL_INTERVAL)),
        RestoreProgress::Succeeded => {
            let (ready, desired) = Materializer::new(ctx, db).readiness().await?;
            apply_event(
                db,
                ctx,
                ns,
                DatabaseEvent::RestoreSucceeded,
                &TransitionContext::new(ready, desired),
                None,
                Some((ready, desired)),
            )
            .await?;
            ctx.publish_normal(
                &db.object_ref(&()),
                reasons::RESTORE_SUCCEEDED,
                actions::RESTORE,
                "Restored from snapshot".to_string(),
            )
            .await;
            sync_schedule(db, ctx, ns).await?;
            Ok(Action::requeue(STEADY_STATE_REQUEUE))
        }
        RestoreProgress::Failed(message) => {
            let reason = format!("Restore failed: {}", message);
            ctx.publish_warning(
                &db.object_ref(&()),
                reasons::RESTORE_FAILED,
                actions::RESTORE,
                reason.clone(),
            )
            .await;
            fail(db, ctx, ns, DatabaseEvent::RestoreFailed, &reason).await
        }
    }
}

/// Delete the DormantDatabase once the resumed database is Running
async fn finish_resume(
    db: &Elasticsearch,
    ctx: &Context,
    ns: &str,
    dormant: &DormantDatabase,
) -> Result<()> {
    let api: Api<DormantDatabase> = Api::namespaced(ctx.client.clone(), ns);
    match api.delete(&dormant.name_any(), &Default::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    info!("Resumed from DormantDatabase");
    ctx.publish_normal(
        &db.object_ref(&()),
        reasons::RESUMED,
        actions::RESUME,
        format!("Resumed from DormantDatabase {}", dormant.name_any()),
    )
    .await;
    Ok(())
}

/// Register, replace or remove the backup schedule to match the spec
async fn sync_schedule(db: &Elasticsearch, ctx: &Context, ns: &str) -> Result<()> {
    let name = db.name_any();
    let key = schedule_key(ns, &name);

    match &db.spec.backup_schedule {
        Some(schedule) => {
            let fp = fingerprint(schedule);
            if ctx.scheduler.fingerprint(&key).as_deref() != Some(fp.as_str()) {
                ctx.scheduler.register(
                    &key,
                    &schedule.cron_expression,
                    &fp,
                    backup_job(
                        ctx.client.clone(),
                        name.clone(),
                        ns.to_string(),
                        schedule.storage.clone(),
                    ),
                )?;
                ctx.publish_normal(
                    &db.object_ref(&()),
                    reasons::SCHEDULE_REGISTERED,
                    actions::SCHEDULE,
                    format!("Backup schedule {:?} registered", schedule.cron_expression),
                )
                .await;
            }
        }
        None => {
            if ctx.scheduler.unregister(&key) {
                ctx.publish_normal(
                    &db.object_ref(&()),
                    reasons::SCHEDULE_REMOVED,
                    actions::SCHEDULE,
                    "Backup schedule removed".to_string(),
                )
                .await;
            }
        }
    }

    record_schedule_count(ctx);
    Ok(())
}

fn record_schedule_count(ctx: &Context) {
    if let Some(health) = &ctx.health_state {
        health
            .metrics
            .set_backup_schedules(ctx.scheduler.len() as i64);
    }
}

/// Check if the finalizer is present
fn has_finalizer(db: &Elasticsearch) -> bool {
    db.finalizers().iter().any(|f| f == FINALIZER)
}

/// Add the finalizer to the resource
async fn add_finalizer(db: &Elasticsearch, ctx: &Context, ns: &str) -> Result<()> {
    let api: Api<Elasticsearch> = Api::namespaced(ctx.client.clone(), ns);
    let name = db.name_any();

    let mut finalizers = db.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });

    api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;

    info!("Added finalizer to {}", name);
    Ok(())
}

async fn remove_finalizer(db: &Elasticsearch, ctx: &Context, ns: &str) -> Result<()> {
    let api: Api<Elasticsearch> = Api::namespaced(ctx.client.clone(), ns);
    let name = db.name_any();

    let remaining: Vec<String> = db
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect();
    let patch = if remaining.is_empty() {
        serde_json::json!({ "metadata": { "finalizers": null } })
    } else {
        serde_json::json!({ "metadata": { "finalizers": remaining } })
    };

    match api
        .patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
    {
        Ok(_) | Err(kube::Error::Api(kube::error::ErrorResponse { code: 404, .. })) => {}
        Err(e) => return Err(e.into()),
    }

    info!("Removed finalizer from {}", name);
    Ok(())
}

/// Apply the termination policy, then release the finalizer
async fn handle_deletion(db: &Elasticsearch, ctx: &Context, ns: &str) -> Result<Action> {
    if !has_finalizer(db) {
        return Ok(Action::await_change());
    }

    let name = db.name_any();
    let mut db = db.clone();
    info!(policy = %db.spec.termination_policy(), "Handling deletion of {}", name);

    if !db.phase().is_deletion_outcome() {
        apply_event(
            &mut db,
            ctx,
            ns,
            DatabaseEvent::DeletionRequested,
            &TransitionContext::default(),
            None,
            None,
        )
        .await?;
    }

    if ctx.scheduler.unregister(&schedule_key(ns, &name)) {
        record_schedule_count(ctx);
    }

    let policy = match db.spec.termination_policy() {
        TerminationPolicy::DoNotTerminate => {
            ctx.publish_warning(
                &db.object_ref(&()),
                reasons::DO_NOT_TERMINATE,
                actions::DELETE,
                "Deleted despite DoNotTerminate, pausing instead".to_string(),
            )
            .await;
            TerminationPolicy::Pause
        }
        policy => policy,
    };

    let (event, reason, note) = match policy {
        TerminationPolicy::Delete => {
            teardown::delete_workloads(&ctx.client, ns, &name).await?;
            (
                DatabaseEvent::TerminationDeleted,
                reasons::DELETED,
                "Deleted workloads and volumes, kept secrets and snapshots",
            )
        }
        TerminationPolicy::WipeOut => {
            teardown::wipe_out(ctx, ns, &name).await?;
            (
                DatabaseEvent::TerminationWipedOut,
                reasons::WIPED_OUT,
                "Wiped out workloads, volumes, secrets and snapshots",
            )
        }
        _ => {
            teardown::orphan_database_objects(&ctx.client, ns, &name).await?;
            pause_database(ctx, &db).await?;
            (
                DatabaseEvent::TerminationPaused,
                reasons::PAUSED,
                "Paused into a DormantDatabase",
            )
        }
    };

    if db.phase() == DatabasePhase::Deleting {
        apply_event(
            &mut db,
            ctx,
            ns,
            event,
            &TransitionContext::default(),
            None,
            Some((0, 0)),
        )
        .await?;
    }
    ctx.publish_normal(&db.object_ref(&()), reason, actions::DELETE, note.to_string())
        .await;

    remove_finalizer(&db, ctx, ns).await?;
    Ok(Action::await_change())
}
