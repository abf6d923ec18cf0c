//! Defaulting applied by the mutating webhook
//!
//! Defaulting is idempotent: applying it to an already defaulted spec
//! changes nothing, which keeps the mutate patch empty on no-op updates.

use crate::crd::{DEFAULT_EXPORTER_PORT, DormantDatabase, ElasticsearchSpec};

/// Access mode used when a storage spec names none
pub const DEFAULT_ACCESS_MODE: &str = "ReadWriteOnce";

/// Fill in defaults on a spec
///
/// An unset `terminationPolicy` becomes Delete for ephemeral storage and
/// Pause otherwise. When a DormantDatabase with the same name exists, unset `monitor` and
/// `backupSchedule` are inherited from its origin so a resumed database
/// keeps its monitoring and backups.
pub fn default_spec(spec: &mut ElasticsearchSpec, dormant: Option<&DormantDatabase>) {
    for node in spec.shape.node_groups_mut() {
        if node.replicas.is_none() {
            node.replicas = Some(1);
        }
        if let Some(storage) = node.storage.as_mut()
            && storage.access_modes.is_empty()
        {
            storage.access_modes = vec![DEFAULT_ACCESS_MODE.to_string()];
        }
    }

    if spec.termination_policy.is_none() {
        spec.termination_policy = Some(spec.termination_policy());
    }

    if let Some(dormant) = dormant {
        let origin = &dormant.spec.origin.spec;
        if spec.monitor.is_none() {
            spec.monitor = origin.monitor.clone();
        }
        if spec.backup_schedule.is_none() {
            spec.backup_schedule = origin.backup_schedule.clone();
        }
    }

    if let Some(monitor) = spec.monitor.as_mut()
        && monitor.enabled
        && monitor.port.is_none()
    {
        monitor.port = Some(DEFAULT_EXPORTER_PORT);
    }
}
