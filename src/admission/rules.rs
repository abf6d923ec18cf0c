//! Pure validation rules
//!
//! These checks need nothing but the objects themselves. Checks that
//! consult the cluster (storage classes, secrets, buckets) live on
//! [`super::AdmissionGuard`].

use crate::controller::error::{Error, Result};
use crate::controller::scheduler::CronSchedule;
use crate::crd::{
    BackupScheduleSpec, ClusterShape, Elasticsearch, ElasticsearchSpec, NodeRole,
    SnapshotSpec, SnapshotStorageSpec, StorageType, TerminationPolicy,
};
use crate::resources::common::parse_quantity;

fn invalid(message: impl Into<String>) -> Error {
    Error::ValidationError(message.into())
}

/// `spec.version` must be set
pub fn validate_version(spec: &ElasticsearchSpec) -> Result<()> {
    if spec.version.trim().is_empty() {
        return Err(invalid("spec.version is missing"));
    }
    Ok(())
}

/// Ephemeral storage cannot be paused: the data would be gone on resume
pub fn validate_termination_policy(spec: &ElasticsearchSpec) -> Result<()> {
    if spec.storage_type == StorageType::Ephemeral
        && spec.termination_policy() == TerminationPolicy::Pause
    {
        return Err(invalid(
            "terminationPolicy Pause is not supported with storageType Ephemeral",
        ));
    }
    Ok(())
}

/// A restore source must live in the database's namespace
///
/// The restore job mounts the snapshot's storage secret, and a pod can only
/// mount secrets from its own namespace.
pub fn validate_snapshot_source(spec: &ElasticsearchSpec, namespace: &str) -> Result<()> {
    let Some(source) = spec.init.as_ref().and_then(|i| i.snapshot_source.as_ref()) else {
        return Ok(());
    };
    if source.name.trim().is_empty() {
        return Err(invalid("spec.init.snapshotSource.name is missing"));
    }
    match source.namespace.as_deref() {
        Some(ns) if ns != namespace => Err(invalid(format!(
            "spec.init.snapshotSource.namespace {:?} differs from the database namespace {:?}",
            ns, namespace
        ))),
        _ => Ok(()),
    }
}

/// Replica counts, disruption budgets and storage requests of every node group
///
/// Returns the storage classes that still need an existence check, in
/// node group order and without duplicates.
pub fn validate_node_groups(spec: &ElasticsearchSpec) -> Result<Vec<String>> {
    let mut classes: Vec<String> = Vec::new();

    for (role, node) in spec.shape.node_groups() {
        if let Some(replicas) = node.replicas
            && replicas < 0
        {
            return Err(invalid(format!(
                "{} replicas must not be negative, got {}",
                role, replicas
            )));
        }

        if let Some(max_unavailable) = node.max_unavailable
            && max_unavailable < 1
        {
            return Err(invalid(format!(
                "{} maxUnavailable must be at least 1, got {}",
                role, max_unavailable
            )));
        }

        if let Some(prefix) = &node.prefix
            && (prefix.is_empty() || prefix.contains('/'))
        {
            return Err(invalid(format!("{} prefix {:?} is not valid", role, prefix)));
        }

        let Some(storage) = &node.storage else {
            continue;
        };

        match parse_quantity(&storage.size) {
            Some(bytes) if bytes > 0 => {}
            Some(_) => {
                return Err(invalid(format!(
                    "{} storage request must be positive, got {}",
                    role, storage.size
                )));
            }
            None => {
                return Err(invalid(format!(
                    "{} storage request {:?} is not a valid quantity",
                    role, storage.size
                )));
            }
        }

        if spec.storage_type == StorageType::Durable {
            match storage.storage_class_name.as_deref() {
                Some(class) if !class.is_empty() => {
                    if !classes.iter().any(|c| c == class) {
                        classes.push(class.to_string());
                    }
                }
                _ => {
                    return Err(invalid(format!(
                        "{} storage.storageClassName is missing",
                        role
                    )));
                }
            }
        }
    }

    Ok(classes)
}

/// Storage backend descriptor must name a bucket and a credentials secret
pub fn validate_storage_descriptor(storage: &SnapshotStorageSpec) -> Result<()> {
    if storage.backend.bucket().trim().is_empty() {
        return Err(invalid("storage bucket is missing"));
    }
    if storage.storage_secret_name.trim().is_empty() {
        return Err(invalid("storage.storageSecretName is missing"));
    }
    Ok(())
}

/// Cron expression and backend descriptor of a backup schedule
pub fn validate_backup_schedule(schedule: &BackupScheduleSpec) -> Result<()> {
    if schedule.cron_expression.trim().is_empty() {
        return Err(invalid("backupSchedule.cronExpression is missing"));
    }
    CronSchedule::parse(&schedule.cron_expression)
        .map_err(|e| invalid(format!("backupSchedule.cronExpression: {}", e)))?;
    validate_storage_descriptor(&schedule.storage)
}

/// Snapshot fields that do not need the cluster
pub fn validate_snapshot_spec(spec: &SnapshotSpec) -> Result<()> {
    if spec.database_name.trim().is_empty() {
        return Err(invalid("spec.databaseName is missing"));
    }
    if let Some(volume) = &spec.pod_volume
        && let Some(size) = &volume.size
        && !parse_quantity(size).is_some_and(|b| b > 0)
    {
        return Err(invalid(format!("podVolume.size {:?} is not valid", size)));
    }
    validate_storage_descriptor(&spec.storage)
}

/// Fields that cannot change once the database exists
pub fn validate_immutable(old: &ElasticsearchSpec, new: &ElasticsearchSpec) -> Result<()> {
    if old.storage_type != new.storage_type {
        return Err(invalid("spec.storageType is immutable"));
    }

    if old.shape.is_topology() != new.shape.is_topology() {
        return Err(invalid(
            "switching between flat and topology cluster shapes is not supported",
        ));
    }

    let old_groups = old.shape.node_groups();
    for (role, node) in new.shape.node_groups() {
        let Some((_, previous)) = old_groups.iter().find(|(r, _)| *r == role) else {
            continue;
        };
        let old_class = previous
            .storage
            .as_ref()
            .and_then(|s| s.storage_class_name.as_deref());
        let new_class = node
            .storage
            .as_ref()
            .and_then(|s| s.storage_class_name.as_deref());
        if old_class.is_some() && old_class != new_class {
            return Err(invalid(format!(
                "{} storage.storageClassName is immutable",
                role_path(&new.shape, role)
            )));
        }
    }

    Ok(())
}

/// Deletion is refused while the live object says DoNotTerminate
pub fn validate_delete(live: &Elasticsearch) -> Result<()> {
    if live.spec.termination_policy() == TerminationPolicy::DoNotTerminate {
        return Err(invalid(format!(
            "Elasticsearch {} can't be deleted while terminationPolicy is DoNotTerminate; \
             change it first",
            live.metadata.name.as_deref().unwrap_or_default()
        )));
    }
    Ok(())
}

fn role_path(shape: &ClusterShape, role: NodeRole) -> String {
    match shape {
        ClusterShape::Flat(_) => "spec.flat".to_string(),
        ClusterShape::Topology(_) => format!("spec.topology.{}", role),
    }
}
