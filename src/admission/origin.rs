//! Comparison of an incoming spec with a DormantDatabase origin
//!
//! Recreating a paused database must reuse its workloads, so the new spec
//! has to match the captured one. Each field is compared explicitly and
//! the allow-listed fields are simply never visited:
//! `serviceAccountName`, `updateStrategy` and `terminationPolicy`.

use std::fmt;

use serde::Serialize;

use crate::crd::{ClusterShape, ElasticsearchSpec, NodeRole, NodeSpec};

/// One differing field
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldChange {
    /// JSON path of the field, e.g. `spec.topology.data.replicas`
    pub path: String,
    /// Value captured in the origin
    pub origin: String,
    /// Value in the incoming spec
    pub requested: String,
}

/// All differences between an origin and an incoming spec
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OriginDiff {
    pub changes: Vec<FieldChange>,
}

impl OriginDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn paths(&self) -> Vec<&str> {
        self.changes.iter().map(|c| c.path.as_str()).collect()
    }

    fn field<T: Serialize + PartialEq>(&mut self, path: &str, origin: &T, requested: &T) {
        if origin != requested {
            self.changes.push(FieldChange {
                path: path.to_string(),
                origin: render(origin),
                requested: render(requested),
            });
        }
    }
}

impl fmt::Display for OriginDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, change) in self.changes.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(
                f,
                "{}: {} -> {}",
                change.path, change.origin, change.requested
            )?;
        }
        Ok(())
    }
}

fn render<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "<unrenderable>".to_string())
}

fn shape_key(shape: &ClusterShape) -> &'static str {
    match shape {
        ClusterShape::Flat(_) => "flat",
        ClusterShape::Topology(_) => "topology",
    }
}

fn node_path(role: NodeRole) -> String {
    match role {
        NodeRole::Combined => "spec.flat".to_string(),
        role => format!("spec.topology.{}", role.as_str()),
    }
}

fn diff_node(diff: &mut OriginDiff, path: &str, origin: &NodeSpec, requested: &NodeSpec) {
    // Compared on effective values so an undefaulted spec still matches
    diff.field(
        &format!("{}.replicas", path),
        &origin.replicas(),
        &requested.replicas(),
    );
    diff.field(&format!("{}.prefix", path), &origin.prefix, &requested.prefix);

    match (&origin.storage, &requested.storage) {
        (Some(o), Some(r)) => {
            diff.field(
                &format!("{}.storage.storageClassName", path),
                &o.storage_class_name,
                &r.storage_class_name,
            );
            diff.field(&format!("{}.storage.size", path), &o.size, &r.size);
            let modes = |m: &Vec<String>| {
                if m.is_empty() {
                    vec![super::defaults::DEFAULT_ACCESS_MODE.to_string()]
                } else {
                    m.clone()
                }
            };
            diff.field(
                &format!("{}.storage.accessModes", path),
                &modes(&o.access_modes),
                &modes(&r.access_modes),
            );
        }
        (o, r) => diff.field(&format!("{}.storage", path), o, r),
    }

    diff.field(
        &format!("{}.resources", path),
        &origin.resources,
        &requested.resources,
    );
    diff.field(
        &format!("{}.maxUnavailable", path),
        &origin.max_unavailable,
        &requested.max_unavailable,
    );
}

/// Compare an incoming spec against the captured origin
pub fn diff_origin(origin: &ElasticsearchSpec, requested: &ElasticsearchSpec) -> OriginDiff {
    let mut diff = OriginDiff::default();

    diff.field("spec.version", &origin.version, &requested.version);

    if shape_key(&origin.shape) != shape_key(&requested.shape) {
        diff.field(
            "spec.shape",
            &shape_key(&origin.shape),
            &shape_key(&requested.shape),
        );
    } else {
        let origin_groups = origin.shape.node_groups();
        let requested_groups = requested.shape.node_groups();
        for role in [
            NodeRole::Combined,
            NodeRole::Master,
            NodeRole::Data,
            NodeRole::Warm,
            NodeRole::Client,
        ] {
            let o = origin_groups.iter().find(|(r, _)| *r == role).map(|(_, n)| *n);
            let r = requested_groups
                .iter()
                .find(|(r, _)| *r == role)
                .map(|(_, n)| *n);
            match (o, r) {
                (Some(o), Some(r)) => diff_node(&mut diff, &node_path(role), o, r),
                (None, None) => {}
                (o, r) => diff.field(&node_path(role), &o, &r),
            }
        }
    }

    diff.field("spec.storageType", &origin.storage_type, &requested.storage_type);
    diff.field("spec.tls", &origin.tls, &requested.tls);
    diff.field("spec.auth", &origin.auth, &requested.auth);
    diff.field(
        "spec.monitor.enabled",
        &origin.monitor.as_ref().is_some_and(|m| m.enabled),
        &requested.monitor.as_ref().is_some_and(|m| m.enabled),
    );
    diff.field(
        "spec.monitor.port",
        &origin.monitor.as_ref().map(|m| m.port()),
        &requested.monitor.as_ref().map(|m| m.port()),
    );
    diff.field(
        "spec.backupSchedule",
        &origin.backup_schedule,
        &requested.backup_schedule,
    );
    diff.field("spec.init", &origin.init, &requested.init);
    diff.field(
        "spec.nodeSelector",
        &origin.node_selector,
        &requested.node_selector,
    );
    diff.field("spec.env", &origin.env, &requested.env);
    diff.field(
        "spec.configSource",
        &origin.config_source,
        &requested.config_source,
    );

    diff
}
