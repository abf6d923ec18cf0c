//! Backup scheduling
//!
//! `BackupScheduler` is a process-wide cron registry keyed by database
//! (`<namespace>/<name>`). Each entry owns a timer task; replacing or
//! removing an entry aborts the task under the registry lock, so a fire can
//! never run for an entry that is no longer registered.
//!
//! A fire creates a `Snapshot` unless one is already running for the
//! database. The running check is a list followed by a create, so two
//! operators racing the same window can both pass it. The loser of a name
//! collision sees a 409 and skips.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use kube::api::{ListParams, PostParams};
use kube::core::ObjectMeta;
use kube::{Api, Client};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::controller::error::{Error, Result};
use crate::controller::snapshot::running_snapshot;
use crate::crd::{
    BackupScheduleSpec, Snapshot, SnapshotPhase, SnapshotSpec, SnapshotStorageSpec,
};
use crate::resources::common::{DATABASE_LABEL, snapshot_phase_selector};
use crate::resources::standard_labels;

/// Work run on every cron fire
pub type BackupJob = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A parsed schedule expression
#[derive(Clone, Debug)]
pub enum CronSchedule {
    /// Calendar expression
    Cron(Box<cron::Schedule>),
    /// Fixed interval from `@every <duration>`
    Every(Duration),
}

impl CronSchedule {
    /// Parse a 5-field, 6/7-field, `@macro` or `@every` expression
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err(Error::ScheduleError("cron expression is empty".to_string()));
        }

        if let Some(interval) = expression.strip_prefix("@every") {
            let interval = parse_interval(interval.trim())?;
            return Ok(CronSchedule::Every(interval));
        }

        // Minute-precision expressions get a leading seconds field
        let normalized = if !expression.starts_with('@')
            && expression.split_whitespace().count() == 5
        {
            format!("0 {}", expression)
        } else {
            expression.to_string()
        };

        cron::Schedule::from_str(&normalized)
            .map(|s| CronSchedule::Cron(Box::new(s)))
            .map_err(|e| Error::ScheduleError(format!("invalid cron expression {:?}: {}", expression, e)))
    }

    /// First fire time strictly after `now`
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            CronSchedule::Cron(schedule) => schedule.after(&now).next(),
            CronSchedule::Every(interval) => {
                chrono::Duration::from_std(*interval).ok().map(|d| now + d)
            }
        }
    }
}

/// Parse Go-style durations such as `1h30m`, `45s` or `2h`
pub fn parse_interval(input: &str) -> Result<Duration> {
    let invalid = || Error::ScheduleError(format!("invalid @every interval {:?}", input));
    if input.is_empty() {
        return Err(invalid());
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in input.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: u64 = digits.parse().map_err(|_| invalid())?;
        digits.clear();
        let unit = match c {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return Err(invalid()),
        };
        total = value
            .checked_mul(unit)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(invalid)?;
    }

    if !digits.is_empty() || total == 0 {
        return Err(invalid());
    }
    Ok(Duration::from_secs(total))
}

/// Fingerprint of a backup spec; a new fingerprint means re-register
pub fn fingerprint(spec: &BackupScheduleSpec) -> String {
    serde_json::to_string(spec).unwrap_or_else(|_| spec.cron_expression.clone())
}

/// Registry key for a database
pub fn schedule_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

struct Entry {
    expression: String,
    fingerprint: String,
    generation: u64,
    handle: JoinHandle<()>,
}

/// Cron registry with one entry per database
#[derive(Default)]
pub struct BackupScheduler {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    next_generation: AtomicU64,
}

fn lock(entries: &Mutex<HashMap<String, Entry>>) -> MutexGuard<'_, HashMap<String, Entry>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BackupScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `job` under `key`, replacing any existing entry
    ///
    /// Must be called from within a Tokio runtime.
    pub fn register(
        &self,
        key: &str,
        expression: &str,
        fingerprint: &str,
        job: BackupJob,
    ) -> Result<()> {
        let schedule = CronSchedule::parse(expression)?;
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);

        let mut entries = lock(&self.entries);
        let handle = tokio::spawn(run_entry(
            Arc::clone(&self.entries),
            key.to_string(),
            generation,
            schedule,
            job,
        ));

        if let Some(previous) = entries.insert(
            key.to_string(),
            Entry {
                expression: expression.to_string(),
                fingerprint: fingerprint.to_string(),
                generation,
                handle,
            },
        ) {
            previous.handle.abort();
            debug!(key, old = %previous.expression, new = expression, "Replaced backup schedule");
        } else {
            info!(key, expression, "Registered backup schedule");
        }
        Ok(())
    }

    /// Remove the entry for `key`; returns whether one existed
    pub fn unregister(&self, key: &str) -> bool {
        match lock(&self.entries).remove(key) {
            Some(entry) => {
                entry.handle.abort();
                info!(key, "Unregistered backup schedule");
                true
            }
            None => false,
        }
    }

    /// Cancel every entry
    pub fn shutdown(&self) {
        let mut entries = lock(&self.entries);
        for (_, entry) in entries.drain() {
            entry.handle.abort();
        }
        info!("Backup scheduler stopped");
    }

    pub fn is_registered(&self, key: &str) -> bool {
        lock(&self.entries).contains_key(key)
    }

    /// Fingerprint recorded for `key`
    pub fn fingerprint(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).map(|e| e.fingerprint.clone())
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for BackupScheduler {
    fn drop(&mut self) {
        for (_, entry) in lock(&self.entries).drain() {
            entry.handle.abort();
        }
    }
}

async fn run_entry(
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    key: String,
    generation: u64,
    schedule: CronSchedule,
    job: BackupJob,
) {
    loop {
        let now = Utc::now();
        let Some(next) = schedule.next_after(now) else {
            debug!(key, "Schedule has no further fire times");
            return;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        let current = lock(&entries)
            .get(&key)
            .is_some_and(|e| e.generation == generation);
        if !current {
            return;
        }

        debug!(key, "Backup schedule fired");
        job().await;
    }
}

/// Build the Snapshot a cron fire creates
pub fn scheduled_snapshot(
    db_name: &str,
    namespace: &str,
    storage: &SnapshotStorageSpec,
    now: DateTime<Utc>,
) -> Snapshot {
    let mut labels: BTreeMap<String, String> = standard_labels(db_name);
    labels.insert(DATABASE_LABEL.to_string(), db_name.to_string());

    Snapshot {
        metadata: ObjectMeta {
            name: Some(format!("{}-{}", db_name, now.format("%Y%m%d-%H%M%S"))),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: SnapshotSpec {
            database_name: db_name.to_string(),
            storage: storage.clone(),
            pod_volume: None,
        },
        status: None,
    }
}

/// Create a scheduled snapshot unless one is already running
///
/// Returns the created snapshot name, `None` when the fire was skipped.
pub async fn trigger_backup(
    client: Client,
    db_name: &str,
    namespace: &str,
    storage: &SnapshotStorageSpec,
) -> Result<Option<String>> {
    let snapshots: Api<Snapshot> = Api::namespaced(client, namespace);

    let running = snapshots
        .list(&ListParams::default().labels(&snapshot_phase_selector(db_name, SnapshotPhase::Running)))
        .await?;
    if running_snapshot(&running.items, db_name, None).is_some() {
        info!(
            database = %db_name,
            namespace = %namespace,
            "Skipping scheduled backup, one is still active"
        );
        return Ok(None);
    }

    let snapshot = scheduled_snapshot(db_name, namespace, storage, Utc::now());
    match snapshots.create(&PostParams::default(), &snapshot).await {
        Ok(created) => {
            let name = created.metadata.name.unwrap_or_default();
            info!(database = %db_name, snapshot = %name, "Created scheduled snapshot");
            Ok(Some(name))
        }
        Err(kube::Error::Api(e)) if e.code == 409 => {
            debug!(database = %db_name, "Scheduled snapshot already exists, skipping");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Job closure for a database's schedule
pub fn backup_job(client: Client, db_name: String, namespace: String, storage: SnapshotStorageSpec) -> BackupJob {
    Arc::new(move || {
        let client = client.clone();
        let db_name = db_name.clone();
        let namespace = namespace.clone();
        let storage = storage.clone();
        Box::pin(async move {
            if let Err(e) = trigger_backup(client, &db_name, &namespace, &storage).await {
                warn!(database = %db_name, namespace = %namespace, error = %e, "Scheduled backup failed");
            }
        })
    })
}
