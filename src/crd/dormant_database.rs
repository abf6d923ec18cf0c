//! DormantDatabase CRD definition
//!
//! A DormantDatabase is the tombstone left behind when an Elasticsearch
//! resource with the `Pause` termination policy is deleted. It captures the
//! original object so that recreating a database with the same name resumes
//! the existing workloads instead of provisioning from scratch.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ElasticsearchSpec;

/// DormantDatabase is the Schema for the dormantdatabases API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "elasticsearch-operator.smoketurner.com",
    version = "v1alpha1",
    kind = "DormantDatabase",
    plural = "dormantdatabases",
    shortname = "drmn",
    namespaced,
    status = "DormantDatabaseStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DormantDatabaseSpec {
    /// The paused database as it was when deleted
    pub origin: Origin,

    /// Remove every derived resource and snapshot, then delete this record
    #[serde(default)]
    pub wipe_out: bool,

    /// Recreate the Elasticsearch resource from `origin`
    #[serde(default)]
    pub resume: bool,
}

/// Captured metadata and spec of the paused database
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    pub spec: ElasticsearchSpec,
}

/// Status of the DormantDatabase resource
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DormantDatabaseStatus {
    #[serde(default)]
    pub phase: DormantPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// When the database was paused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<String>,

    /// When wipe-out completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wiped_out_at: Option<String>,
}

/// DormantDatabase lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum DormantPhase {
    #[default]
    Paused,
    Resuming,
    WipingOut,
    WipedOut,
    Failed,
}

impl DormantPhase {
    /// Phases from which recreating the database resumes it
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DormantPhase::Paused | DormantPhase::Resuming)
    }
}

impl std::fmt::Display for DormantPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DormantPhase::Paused => write!(f, "Paused"),
            DormantPhase::Resuming => write!(f, "Resuming"),
            DormantPhase::WipingOut => write!(f, "WipingOut"),
            DormantPhase::WipedOut => write!(f, "WipedOut"),
            DormantPhase::Failed => write!(f, "Failed"),
        }
    }
}

impl DormantDatabase {
    /// Current phase, treating a missing status as freshly paused
    pub fn phase(&self) -> DormantPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}
