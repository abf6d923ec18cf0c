//! Snapshot CRD definition
//!
//! A Snapshot records one backup of an Elasticsearch database to object
//! storage. The operator runs a Job per Snapshot and reports its outcome in
//! the status. Snapshots created by a backup schedule are named
//! `<database>-YYYYMMDD-HHMMSS`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::SnapshotStorageSpec;

/// Snapshot is the Schema for the snapshots API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "elasticsearch-operator.smoketurner.com",
    version = "v1alpha1",
    kind = "Snapshot",
    plural = "snapshots",
    shortname = "snap",
    namespaced,
    status = "SnapshotStatus",
    printcolumn = r#"{"name":"Database", "type":"string", "jsonPath":".spec.databaseName"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSpec {
    /// Name of the Elasticsearch database in the same namespace
    pub database_name: String,

    /// Where the snapshot data is written
    pub storage: SnapshotStorageSpec,

    /// Scratch volume used by the backup job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_volume: Option<PodVolumeSpec>,
}

/// Scratch volume override for the backup/restore job
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodVolumeSpec {
    /// Storage class of the scratch PVC (defaults to the data role's)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Size of the scratch volume (defaults to the data role's storage size)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    /// Use an emptyDir instead of a PVC
    #[serde(default)]
    pub ephemeral: bool,
}

/// Status of the Snapshot resource
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStatus {
    #[serde(default)]
    pub phase: SnapshotPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,

    /// Job performing the backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
}

/// Snapshot lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum SnapshotPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl SnapshotPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SnapshotPhase::Succeeded | SnapshotPhase::Failed)
    }
}

impl std::fmt::Display for SnapshotPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotPhase::Pending => write!(f, "Pending"),
            SnapshotPhase::Running => write!(f, "Running"),
            SnapshotPhase::Succeeded => write!(f, "Succeeded"),
            SnapshotPhase::Failed => write!(f, "Failed"),
        }
    }
}

impl Snapshot {
    pub fn phase(&self) -> SnapshotPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}
