//! Snapshot/Restore Orchestrator
//!
//! Drives each Snapshot through `Pending -> Running -> Succeeded | Failed`
//! by running a one-shot backup Job, and runs the restore Job for
//! databases initialized from a snapshot.
//!
//! A Pending snapshot is admitted only when no other snapshot of the same
//! database is Running. The check lists by the phase label, so it shares
//! the list-then-act window of the backup scheduler.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::admission::rules;
use crate::controller::Context;
use crate::controller::error::{Error, Result};
use crate::controller::events::{actions, reasons};
use crate::controller::materializer::create_if_absent;
use crate::crd::{
    Elasticsearch, PodVolumeSpec, Snapshot, SnapshotPhase, SnapshotStatus, StorageType,
};
use crate::resources::common::{
    DATABASE_LABEL, FIELD_MANAGER, SNAPSHOT_PHASE_LABEL, controller_owner_reference,
    owner_reference, snapshot_phase_selector, standard_labels,
};
use crate::resources::job::{
    DEFAULT_SCRATCH_SIZE, DumpJobParams, GENERATION_LABEL, JobOutcome, JobProcess, ScratchVolume,
    backup_job_name, generate_dump_job, generate_scratch_pvc, job_outcome, restore_job_name,
};

/// Interval between job polls
pub const JOB_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Reason recorded on a snapshot rejected by the one-running rule
pub const ALREADY_RUNNING: &str = "One Snapshot is already Running";

/// Scratch space for a dump job
///
/// Ephemeral databases, or an explicit `podVolume.ephemeral`, get an
/// emptyDir. Otherwise a PVC sized from the override or the data role.
pub fn scratch_volume(db: &Elasticsearch, pod_volume: Option<&PodVolumeSpec>) -> ScratchVolume {
    let data = db.spec.shape.data_storage();
    let size = pod_volume
        .and_then(|v| v.size.clone())
        .or_else(|| data.map(|s| s.size.clone()));

    let ephemeral = pod_volume.is_some_and(|v| v.ephemeral)
        || db.spec.storage_type == StorageType::Ephemeral;
    if ephemeral {
        return ScratchVolume::Ephemeral { size };
    }

    ScratchVolume::Claim {
        storage_class_name: pod_volume
            .and_then(|v| v.storage_class_name.clone())
            .or_else(|| data.and_then(|s| s.storage_class_name.clone())),
        size: size.unwrap_or_else(|| DEFAULT_SCRATCH_SIZE.to_string()),
    }
}

/// A Running snapshot of `database` other than `except`
///
/// `snapshots` is the result of a listing by the Running phase label; the
/// phase and database are checked again in case a label is stale.
pub fn running_snapshot<'a>(
    snapshots: &'a [Snapshot],
    database: &str,
    except: Option<&str>,
) -> Option<&'a Snapshot> {
    snapshots.iter().find(|s| {
        s.spec.database_name == database
            && s.phase() == SnapshotPhase::Running
            && except.is_none_or(|name| s.metadata.name.as_deref() != Some(name))
    })
}

/// Whether a job started at `started` has run past `timeout`
pub fn job_timed_out(started: Option<&str>, timeout: Duration, now: DateTime<Utc>) -> bool {
    let Some(started) = started.and_then(|s| DateTime::parse_from_rfc3339(s).ok()) else {
        return false;
    };
    let elapsed = now - started.with_timezone(&Utc);
    elapsed.to_std().is_ok_and(|e| e > timeout)
}

fn terminal_status(
    previous: &SnapshotStatus,
    phase: SnapshotPhase,
    reason: Option<String>,
) -> SnapshotStatus {
    let now = Utc::now().to_rfc3339();
    SnapshotStatus {
        phase,
        reason,
        start_time: previous.start_time.clone().or_else(|| Some(now.clone())),
        completion_time: Some(now),
        job_name: previous.job_name.clone(),
    }
}

/// Writes Snapshot status together with the phase label
struct SnapshotWriter<'a> {
    api: Api<Snapshot>,
    snapshot: &'a Snapshot,
    ctx: &'a Context,
}

impl<'a> SnapshotWriter<'a> {
    fn new(ctx: &'a Context, snapshot: &'a Snapshot) -> Self {
        let ns = snapshot.namespace().unwrap_or_default();
        Self {
            api: Api::namespaced(ctx.client.clone(), &ns),
            snapshot,
            ctx,
        }
    }

    async fn write(&self, status: &SnapshotStatus) -> Result<()> {
        let name = self.snapshot.name_any();
        let labels = BTreeMap::from([
            (
                DATABASE_LABEL.to_string(),
                self.snapshot.spec.database_name.clone(),
            ),
            (SNAPSHOT_PHASE_LABEL.to_string(), status.phase.to_string()),
        ]);
        let labels = serde_json::json!({ "metadata": { "labels": labels } });
        self.api
            .patch(&name, &PatchParams::default(), &Patch::Merge(&labels))
            .await?;
        self.api
            .patch_status(
                &name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&serde_json::json!({ "status": status })),
            )
            .await?;

        if status.phase.is_terminal()
            && let Some(health) = &self.ctx.health_state
        {
            health.metrics.record_snapshot(&status.phase.to_string());
        }
        Ok(())
    }

    /// Mark the snapshot Failed and emit a warning event
    async fn fail(&self, reason: String) -> Result<Action> {
        warn!(snapshot = %self.snapshot.name_any(), reason = %reason, "Snapshot failed");
        let previous = self.snapshot.status.clone().unwrap_or_default();
        self.write(&terminal_status(&previous, SnapshotPhase::Failed, Some(reason.clone())))
            .await?;
        self.ctx
            .publish_warning(
                &self.snapshot.object_ref(&()),
                reasons::SNAPSHOT_FAILED,
                actions::BACKUP,
                reason,
            )
            .await;
        Ok(Action::await_change())
    }
}

/// Reconcile one Snapshot
#[instrument(skip(snapshot, ctx), fields(name = %snapshot.name_any(), namespace = snapshot.namespace().unwrap_or_default()))]
pub async fn reconcile_snapshot(snapshot: Arc<Snapshot>, ctx: Arc<Context>) -> Result<Action> {
    match snapshot.phase() {
        SnapshotPhase::Pending => start_snapshot(&snapshot, &ctx).await,
        SnapshotPhase::Running => poll_snapshot(&snapshot, &ctx).await,
        SnapshotPhase::Succeeded | SnapshotPhase::Failed => Ok(Action::await_change()),
    }
}

async fn start_snapshot(snapshot: &Snapshot, ctx: &Context) -> Result<Action> {
    let ns = snapshot.namespace().unwrap_or_default();
    let name = snapshot.name_any();
    let writer = SnapshotWriter::new(ctx, snapshot);

    if let Err(e) = rules::validate_snapshot_spec(&snapshot.spec) {
        return writer.fail(e.to_string()).await;
    }

    let db_name = &snapshot.spec.database_name;
    let databases: Api<Elasticsearch> = Api::namespaced(ctx.client.clone(), &ns);
    let Some(db) = databases.get_opt(db_name).await? else {
        return writer
            .fail(format!("Elasticsearch {}/{} not found", ns, db_name))
            .await;
    };

    let snapshots: Api<Snapshot> = Api::namespaced(ctx.client.clone(), &ns);
    let running = snapshots
        .list(&ListParams::default().labels(&snapshot_phase_selector(db_name, SnapshotPhase::Running)))
        .await?;
    if let Some(other) = running_snapshot(&running.items, db_name, Some(&name)) {
        debug!(snapshot = %name, running = %other.name_any(), "Another snapshot is running");
        return writer.fail(ALREADY_RUNNING.to_string()).await;
    }

    match ctx.guard().validate_snapshot(snapshot).await {
        Ok(()) => {}
        Err(e @ (Error::ValidationError(_) | Error::StorageError(_))) => {
            return writer.fail(e.to_string()).await;
        }
        Err(e) => return Err(e),
    }

    let job_name = backup_job_name(&name);
    writer
        .write(&SnapshotStatus {
            phase: SnapshotPhase::Running,
            reason: None,
            start_time: Some(Utc::now().to_rfc3339()),
            completion_time: None,
            job_name: Some(job_name.clone()),
        })
        .await?;

    launch_backup_job(ctx, snapshot, &db, &job_name).await?;

    info!(snapshot = %name, job = %job_name, "Started snapshot");
    ctx.publish_normal(
        &snapshot.object_ref(&()),
        reasons::SNAPSHOT_STARTED,
        actions::BACKUP,
        format!("Backup job {} started", job_name),
    )
    .await;

    Ok(Action::requeue(JOB_POLL_INTERVAL))
}

async fn launch_backup_job(
    ctx: &Context,
    snapshot: &Snapshot,
    db: &Elasticsearch,
    job_name: &str,
) -> Result<()> {
    let ns = snapshot.namespace().unwrap_or_default();
    let name = snapshot.name_any();
    let db_name = &snapshot.spec.database_name;

    let params = DumpJobParams {
        name: job_name.to_string(),
        namespace: ns.clone(),
        process: JobProcess::Backup,
        host: db_name,
        database: db_name,
        snapshot: &name,
        storage: &snapshot.spec.storage,
        image: ctx.config.dump_image(&db.spec.version),
        scratch: scratch_volume(db, snapshot.spec.pod_volume.as_ref()),
        owner: controller_owner_reference(snapshot),
        labels: standard_labels(db_name),
    };

    if let Some(pvc) = generate_scratch_pvc(&params) {
        create_if_absent(&Api::<PersistentVolumeClaim>::namespaced(ctx.client.clone(), &ns), &pvc)
            .await?;
    }
    create_if_absent(
        &Api::<Job>::namespaced(ctx.client.clone(), &ns),
        &generate_dump_job(&params),
    )
    .await?;
    Ok(())
}

async fn poll_snapshot(snapshot: &Snapshot, ctx: &Context) -> Result<Action> {
    let ns = snapshot.namespace().unwrap_or_default();
    let name = snapshot.name_any();
    let writer = SnapshotWriter::new(ctx, snapshot);
    let status = snapshot.status.clone().unwrap_or_default();
    let job_name = status
        .job_name
        .clone()
        .unwrap_or_else(|| backup_job_name(&name));

    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &ns);
    let Some(job) = jobs.get_opt(&job_name).await? else {
        // Abandoned between the status write and the job create
        let databases: Api<Elasticsearch> = Api::namespaced(ctx.client.clone(), &ns);
        let Some(db) = databases.get_opt(&snapshot.spec.database_name).await? else {
            return writer
                .fail(format!(
                    "Elasticsearch {}/{} not found",
                    ns, snapshot.spec.database_name
                ))
                .await;
        };
        launch_backup_job(ctx, snapshot, &db, &job_name).await?;
        return Ok(Action::requeue(JOB_POLL_INTERVAL));
    };

    match job_outcome(&job) {
        Some(JobOutcome::Succeeded) => {
            writer
                .write(&terminal_status(&status, SnapshotPhase::Succeeded, None))
                .await?;
            delete_scratch(ctx, &ns, &job_name).await?;
            info!(snapshot = %name, "Snapshot succeeded");
            ctx.publish_normal(
                &snapshot.object_ref(&()),
                reasons::SNAPSHOT_SUCCEEDED,
                actions::BACKUP,
                format!("Backup job {} completed", job_name),
            )
            .await;
            Ok(Action::await_change())
        }
        Some(JobOutcome::Failed(reason)) => {
            delete_scratch(ctx, &ns, &job_name).await?;
            writer.fail(reason).await
        }
        None if job_timed_out(status.start_time.as_deref(), ctx.config.job_timeout, Utc::now()) => {
            let timeout = Error::ConvergenceTimeout {
                what: format!("backup job {}", job_name),
                elapsed: ctx.config.job_timeout,
            };
            jobs.delete(&job_name, &DeleteParams::background()).await?;
            delete_scratch(ctx, &ns, &job_name).await?;
            writer.fail(format!("{}: {}", timeout.reason(), timeout)).await
        }
        None => {
            debug!(snapshot = %name, job = %job_name, "Backup job still running");
            Ok(Action::requeue(JOB_POLL_INTERVAL))
        }
    }
}

/// Delete a job's scratch PVC, if it had one
async fn delete_scratch(ctx: &Context, ns: &str, job_name: &str) -> Result<()> {
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), ns);
    match pvcs.delete(job_name, &DeleteParams::background()).await {
        Ok(_) => {
            debug!(pvc = %job_name, "Deleted scratch volume");
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Progress of a database restore
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestoreProgress {
    /// Waiting for the source snapshot or the job
    Running,
    Succeeded,
    Failed(String),
}

/// What an existing `restore-<db>` job means for the current attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestoreJobState {
    Absent,
    /// Left over from an attempt at another generation of the spec
    Stale,
    Running,
    Succeeded,
    Failed(String),
}

/// Classify the restore job against the database generation
///
/// A job started for an earlier generation never decides the outcome of
/// the current attempt; it has to be replaced.
pub fn restore_job_state(job: Option<&Job>, generation: Option<i64>) -> RestoreJobState {
    let Some(job) = job else {
        return RestoreJobState::Absent;
    };
    let started_for = job
        .labels()
        .get(GENERATION_LABEL)
        .and_then(|g| g.parse::<i64>().ok());
    if started_for != generation {
        return RestoreJobState::Stale;
    }
    match job_outcome(job) {
        Some(JobOutcome::Succeeded) => RestoreJobState::Succeeded,
        Some(JobOutcome::Failed(reason)) => RestoreJobState::Failed(reason),
        None => RestoreJobState::Running,
    }
}

/// Remove the restore job of a database together with its scratch volume
///
/// Called when an attempt ends in failure or times out, so a later attempt
/// starts from a clean slate.
pub async fn cleanup_restore(ctx: &Context, ns: &str, db_name: &str) -> Result<()> {
    let job_name = restore_job_name(db_name);
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), ns);
    match jobs.delete(&job_name, &DeleteParams::background()).await {
        Ok(_) => debug!(job = %job_name, "Deleted restore job"),
        Err(kube::Error::Api(e)) if e.code == 404 => {}
        Err(e) => return Err(e.into()),
    }
    delete_scratch(ctx, ns, &job_name).await
}

/// Launch or poll the restore job of a database
///
/// The source snapshot must have Succeeded. A still-running source is
/// waited for; the caller bounds the wait by the time spent Initializing.
pub async fn ensure_restore(ctx: &Context, db: &Elasticsearch) -> Result<RestoreProgress> {
    let Some(source) = db.snapshot_source() else {
        return Ok(RestoreProgress::Succeeded);
    };
    let ns = db.namespace().unwrap_or_default();
    let db_name = db.name_any();
    let job_name = restore_job_name(&db_name);
    let generation = db.metadata.generation;

    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &ns);
    let job = jobs.get_opt(&job_name).await?;
    match restore_job_state(job.as_ref(), generation) {
        RestoreJobState::Absent => {}
        RestoreJobState::Stale => {
            info!(job = %job_name, "Replacing restore job from an earlier attempt");
            cleanup_restore(ctx, &ns, &db_name).await?;
            // The old job's pods are removed in the background
            return Ok(RestoreProgress::Running);
        }
        RestoreJobState::Running => return Ok(RestoreProgress::Running),
        RestoreJobState::Succeeded => {
            delete_scratch(ctx, &ns, &job_name).await?;
            return Ok(RestoreProgress::Succeeded);
        }
        RestoreJobState::Failed(reason) => {
            cleanup_restore(ctx, &ns, &db_name).await?;
            return Ok(RestoreProgress::Failed(reason));
        }
    }

    // Admission keeps the source in the database namespace
    let snapshots: Api<Snapshot> = Api::namespaced(ctx.client.clone(), &ns);
    let Some(snapshot) = snapshots.get_opt(&source.name).await? else {
        return Ok(RestoreProgress::Failed(format!(
            "Snapshot {}/{} not found",
            ns, source.name
        )));
    };
    match snapshot.phase() {
        SnapshotPhase::Succeeded => {}
        SnapshotPhase::Failed => {
            return Ok(RestoreProgress::Failed(format!(
                "Snapshot {}/{} has failed and cannot be restored",
                ns, source.name
            )));
        }
        phase => {
            debug!(snapshot = %source.name, %phase, "Waiting for source snapshot");
            return Ok(RestoreProgress::Running);
        }
    }

    let mut labels = standard_labels(&db_name);
    if let Some(generation) = generation {
        labels.insert(GENERATION_LABEL.to_string(), generation.to_string());
    }
    let params = DumpJobParams {
        name: job_name.clone(),
        namespace: ns.clone(),
        process: JobProcess::Restore,
        host: &db_name,
        database: &snapshot.spec.database_name,
        snapshot: &source.name,
        storage: &snapshot.spec.storage,
        image: ctx.config.dump_image(&db.spec.version),
        scratch: scratch_volume(db, snapshot.spec.pod_volume.as_ref()),
        owner: owner_reference(db),
        labels,
    };
    if let Some(pvc) = generate_scratch_pvc(&params) {
        create_if_absent(&Api::<PersistentVolumeClaim>::namespaced(ctx.client.clone(), &ns), &pvc)
            .await?;
    }
    create_if_absent(&jobs, &generate_dump_job(&params)).await?;
    info!(database = %db_name, snapshot = %source.name, job = %job_name, "Started restore job");
    Ok(RestoreProgress::Running)
}
