//! Common utilities for Kubernetes resource generation
//!
//! Shared constants, labels, owner references and naming rules used by
//! every resource generator so that derived objects stay consistent.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

use crate::crd::{Elasticsearch, NodeRole, NodeSpec, SnapshotPhase};

/// API version for the operator's CRDs
pub const API_VERSION: &str = "elasticsearch-operator.smoketurner.com/v1alpha1";

/// Kind for the Elasticsearch CRD
pub const KIND: &str = "Elasticsearch";

/// Operator field manager name for server-side apply
pub const FIELD_MANAGER: &str = "elasticsearch-operator";

/// Label holding the owning database name
pub const DATABASE_LABEL: &str = "elasticsearch-operator.smoketurner.com/database";

/// Label holding the node role of per-role objects
pub const ROLE_LABEL: &str = "elasticsearch-operator.smoketurner.com/role";

/// Label mirroring a Snapshot's phase, used to find active snapshots
pub const SNAPSHOT_PHASE_LABEL: &str = "elasticsearch-operator.smoketurner.com/snapshot-phase";

/// Client HTTP port
pub const HTTP_PORT: i32 = 9200;

/// Inter-node transport port
pub const TRANSPORT_PORT: i32 = 9300;

/// Heap used when a node group declares no memory request
pub const DEFAULT_HEAP_BYTES: i64 = 128 * 1024 * 1024;

/// Generate a controller owner reference for any custom resource
pub fn controller_owner_reference<K>(obj: &K) -> OwnerReference
where
    K: Resource<DynamicType = ()>,
{
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: obj.name_any(),
        uid: obj.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Generate an owner reference for an Elasticsearch database
///
/// Derived objects are garbage collected with the database unless the
/// reference is stripped first (Pause).
pub fn owner_reference(db: &Elasticsearch) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: db.name_any(),
        uid: db.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Standard labels for every object derived from a database
pub fn standard_labels(db_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            "elasticsearch".to_string(),
        ),
        (
            "app.kubernetes.io/instance".to_string(),
            db_name.to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (DATABASE_LABEL.to_string(), db_name.to_string()),
    ])
}

/// Labels for per-role objects (StatefulSets, pods, PDBs)
pub fn role_labels(db_name: &str, role: NodeRole) -> BTreeMap<String, String> {
    let mut labels = standard_labels(db_name);
    labels.insert(ROLE_LABEL.to_string(), role.as_str().to_string());
    labels
}

/// Label selector matching every object of a database
pub fn database_selector(db_name: &str) -> String {
    format!("{}={}", DATABASE_LABEL, db_name)
}

/// Label selector matching the database's snapshots in a given phase
pub fn snapshot_phase_selector(db_name: &str, phase: SnapshotPhase) -> String {
    format!(
        "{}={},{}={}",
        DATABASE_LABEL, db_name, SNAPSHOT_PHASE_LABEL, phase
    )
}

/// StatefulSet name for a node group
///
/// Flat clusters use the database name; topology groups are
/// `<prefix>-<db>` with the prefix defaulting to the role name.
pub fn statefulset_name(db_name: &str, role: NodeRole, node: &NodeSpec) -> String {
    match role {
        NodeRole::Combined => db_name.to_string(),
        _ => {
            let prefix = node
                .prefix
                .as_deref()
                .filter(|p| !p.is_empty())
                .unwrap_or(role.as_str());
            format!("{}-{}", prefix, db_name)
        }
    }
}

/// Default TLS certificate secret of a database
pub fn cert_secret_name(db_name: &str) -> String {
    format!("{}-cert", db_name)
}

/// Default generated auth secret of a database
pub fn auth_secret_name(db_name: &str) -> String {
    format!("{}-auth", db_name)
}

/// Parse a Kubernetes resource quantity into its value in base units
///
/// Supports binary (Ki..Ei), decimal (k..E) and milli suffixes and plain
/// numbers. Returns `None` for anything else.
pub fn quantity_value(quantity: &str) -> Option<f64> {
    let q = quantity.trim();
    if q.is_empty() {
        return None;
    }

    const SUFFIXES: &[(&str, f64)] = &[
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Ei", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("m", 0.001),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
    ];

    let (number, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, mult)| q.strip_suffix(suffix).map(|n| (n, *mult)))
        .unwrap_or((q, 1.0));

    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(value * multiplier)
}

/// Parse a Kubernetes resource quantity into whole bytes (or base units)
pub fn parse_quantity(quantity: &str) -> Option<i64> {
    let bytes = quantity_value(quantity)?;
    if bytes > i64::MAX as f64 {
        return None;
    }
    Some(bytes as i64)
}

/// Whether two quantity strings denote the same amount
///
/// The API server rewrites quantities in canonical form ("1.5Gi" reads
/// back as "1536Mi", "0.5" as "500m").
pub fn quantities_equal(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    match (quantity_value(a), quantity_value(b)) {
        (Some(a), Some(b)) => (a - b).abs() <= f64::EPSILON * a.abs().max(b.abs()).max(1.0),
        _ => false,
    }
}

/// JVM heap for a node group: half of the memory request
pub fn heap_size_bytes(node: &NodeSpec) -> i64 {
    node.memory_request()
        .and_then(parse_quantity)
        .map(|bytes| bytes / 2)
        .filter(|bytes| *bytes > 0)
        .unwrap_or(DEFAULT_HEAP_BYTES)
}
