//! Wait condition helpers for Elasticsearch and DormantDatabase resources

use elasticsearch_operator::crd::{
    DatabasePhase, DormantDatabase, DormantPhase, Elasticsearch, Snapshot, SnapshotPhase,
};
use kube::Api;
use kube::runtime::wait::{Condition, await_condition};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WaitError {
    #[error("Timeout waiting for condition")]
    Timeout,

    #[error("Watch error: {0}")]
    Watch(#[from] kube::runtime::wait::Error),

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),
}

/// Elasticsearch is in `expected`
pub fn is_phase(expected: DatabasePhase) -> impl Condition<Elasticsearch> {
    move |obj: Option<&Elasticsearch>| {
        obj.and_then(|db| db.status.as_ref())
            .is_some_and(|status| status.phase == expected)
    }
}

/// Elasticsearch status reason contains `expected`
pub fn has_reason(expected: &str) -> impl Condition<Elasticsearch> {
    let expected = expected.to_string();
    move |obj: Option<&Elasticsearch>| {
        obj.and_then(|db| db.status.as_ref())
            .and_then(|status| status.reason.as_ref())
            .is_some_and(|reason| reason.contains(&expected))
    }
}

/// DormantDatabase is in `expected`
pub fn dormant_is(expected: DormantPhase) -> impl Condition<DormantDatabase> {
    move |obj: Option<&DormantDatabase>| obj.is_some_and(|d| d.phase() == expected)
}

/// Snapshot reached a terminal phase
pub fn snapshot_finished() -> impl Condition<Snapshot> {
    |obj: Option<&Snapshot>| {
        obj.is_some_and(|s| matches!(s.phase(), SnapshotPhase::Succeeded | SnapshotPhase::Failed))
    }
}

/// Object no longer exists
pub fn is_gone<K>() -> impl Condition<K> {
    |obj: Option<&K>| obj.is_none()
}

/// Wait for `condition` on the named object
pub async fn wait_for<K, C>(api: &Api<K>, name: &str, condition: C, timeout: Duration) -> Result<(), WaitError>
where
    K: kube::Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned + Send + 'static,
    C: Condition<K>,
{
    tokio::time::timeout(timeout, await_condition(api.clone(), name, condition))
        .await
        .map_err(|_| WaitError::Timeout)??;
    Ok(())
}
