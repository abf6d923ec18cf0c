//! Topology Materializer, apply side
//!
//! Desired objects come from the pure builders in [`crate::resources`].
//! This module compares them with the live objects and applies only what
//! differs, reporting `Created`, `Patched` or `Unchanged` so the caller
//! knows whether pod readiness has to be re-verified.

use std::fmt::Debug;
use std::time::{Duration, Instant};

use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Secret, Service, ServiceAccount};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use kube::{Api, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::controller::Context;
use crate::controller::error::{Error, Result};
use crate::controller::events::{actions, reasons};
use crate::crd::{Elasticsearch, NodeRole, NodeSpec};
use crate::resources::common::{FIELD_MANAGER, quantities_equal, role_labels, statefulset_name};
use crate::resources::{pdb, secret, service, statefulset};

/// Interval between pod readiness polls
pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Result of a create-or-patch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Patched,
    Unchanged,
}

impl ApplyOutcome {
    /// Whether pods may have changed and readiness must be checked again
    pub fn changed(&self) -> bool {
        !matches!(self, ApplyOutcome::Unchanged)
    }
}

/// How a node group's StatefulSet differs from its desired state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupChange {
    Create,
    /// Only the replica count differs
    Scale { from: i32, to: i32 },
    Patch,
    Unchanged,
}

/// Whether every field set in `desired` has the same value in `live`
///
/// Fields only present in `live` (server-side defaults, status) are
/// ignored. Arrays must have the same length and match element-wise.
/// Values under `requests`, `limits` and `sizeLimit` are quantities and
/// compare by amount, since the API server stores them canonicalized.
pub fn is_json_subset(desired: &Value, live: &Value) -> bool {
    subset(desired, live, false)
}

fn is_quantity_key(key: &str) -> bool {
    matches!(key, "requests" | "limits" | "sizeLimit")
}

fn subset(desired: &Value, live: &Value, quantity: bool) -> bool {
    match (desired, live) {
        (Value::Object(d), Value::Object(l)) => d.iter().all(|(key, value)| match l.get(key) {
            Some(live_value) => subset(value, live_value, quantity || is_quantity_key(key)),
            None => is_empty_value(value),
        }),
        (Value::Array(d), Value::Array(l)) => {
            d.len() == l.len() && d.iter().zip(l).all(|(d, l)| subset(d, l, quantity))
        }
        (Value::Null, _) => true,
        (Value::String(d), Value::String(l)) if quantity => quantities_equal(d, l),
        (d, l) => d == l,
    }
}

/// The API server drops empty maps and lists, so their absence is a match
fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.values().all(is_empty_value),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Decide what an apply of `desired` over `live` would do
pub fn plan_apply<K: Serialize>(desired: &K, live: Option<&K>) -> Result<ApplyOutcome> {
    let Some(live) = live else {
        return Ok(ApplyOutcome::Created);
    };
    let desired = serde_json::to_value(desired)?;
    let live = serde_json::to_value(live)?;
    if is_json_subset(&desired, &live) {
        Ok(ApplyOutcome::Unchanged)
    } else {
        Ok(ApplyOutcome::Patched)
    }
}

fn replicas_of(sts: &StatefulSet) -> i32 {
    sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
}

/// Classify a StatefulSet change so replica-only edits skip a full apply
pub fn plan_statefulset(desired: &StatefulSet, live: Option<&StatefulSet>) -> Result<GroupChange> {
    let Some(live) = live else {
        return Ok(GroupChange::Create);
    };

    let (from, to) = (replicas_of(live), replicas_of(desired));
    let mut at_live_scale = desired.clone();
    if let Some(spec) = at_live_scale.spec.as_mut() {
        spec.replicas = Some(from);
    }

    match plan_apply(&at_live_scale, Some(live))? {
        ApplyOutcome::Unchanged if from == to => Ok(GroupChange::Unchanged),
        ApplyOutcome::Unchanged => Ok(GroupChange::Scale { from, to }),
        _ => Ok(GroupChange::Patch),
    }
}

/// Sum `(ready, desired)` pod counts of the node groups
///
/// Surplus ready pods in one group never make up for another, so the sum
/// reaches `desired` only when every group is ready.
pub fn tally_ready(groups: &[(i32, i32)]) -> (i32, i32) {
    groups.iter().fold((0, 0), |(ready, desired), &(group_ready, group_desired)| {
        (ready + group_ready.min(group_desired), desired + group_desired)
    })
}

/// Reject objects controlled by someone else; orphans are adopted
pub fn check_ownership(meta: &ObjectMeta, owner_uid: &str, kind: &str) -> Result<()> {
    let controller = meta
        .owner_references
        .iter()
        .flatten()
        .find(|r| r.controller == Some(true));

    match controller {
        Some(owner) if owner.uid != owner_uid => Err(Error::ConflictError(format!(
            "intended {} {:?} already exists and is controlled by {} {:?}",
            kind,
            meta.name.as_deref().unwrap_or_default(),
            owner.kind,
            owner.name
        ))),
        _ => Ok(()),
    }
}

/// Create or patch an object owned by a database
pub async fn apply_owned<K>(api: &Api<K>, desired: &K, owner_uid: &str) -> Result<ApplyOutcome>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Serialize
        + DeserializeOwned
        + Clone
        + Debug,
    <K as Resource>::DynamicType: Default,
{
    let name = desired.name_any();
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let live = api.get_opt(&name).await?;

    if let Some(live) = &live {
        check_ownership(live.meta(), owner_uid, &kind)?;
    }

    let outcome = plan_apply(desired, live.as_ref())?;
    if outcome.changed() {
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(desired),
        )
        .await?;
        debug!(kind = %kind, name = %name, ?outcome, "Applied resource");
    }
    Ok(outcome)
}

/// Create an object unless it exists; never patched afterwards
pub async fn create_if_absent<K>(api: &Api<K>, desired: &K) -> Result<bool>
where
    K: Resource + Serialize + DeserializeOwned + Clone + Debug,
{
    let name = desired.name_any();
    if api.get_opt(&name).await?.is_some() {
        return Ok(false);
    }
    match api.create(&PostParams::default(), desired).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

fn selector(labels: &std::collections::BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Materializes one database
pub struct Materializer<'a> {
    ctx: &'a Context,
    db: &'a Elasticsearch,
    ns: String,
    name: String,
    uid: String,
}

impl<'a> Materializer<'a> {
    pub fn new(ctx: &'a Context, db: &'a Elasticsearch) -> Self {
        Self {
            ctx,
            db,
            ns: db.namespace().unwrap_or_default(),
            name: db.name_any(),
            uid: db.metadata.uid.clone().unwrap_or_default(),
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.ctx.client.clone(), &self.ns)
    }

    /// Governing ServiceAccount and headless Service, shared per namespace
    pub async fn ensure_governing(&self) -> Result<()> {
        let governing = &self.ctx.config.governing_service;

        let sa = service::generate_service_account(governing, &self.ns);
        if create_if_absent(&self.api::<ServiceAccount>(), &sa).await? {
            info!(name = %governing, namespace = %self.ns, "Created governing ServiceAccount");
        }

        let svc = service::generate_governing_service(governing, &self.ns);
        if create_if_absent(&self.api::<Service>(), &svc).await? {
            info!(name = %governing, namespace = %self.ns, "Created governing Service");
        }
        Ok(())
    }

    /// Generated admin credentials; created once, never rotated
    pub async fn ensure_auth_secret(&self) -> Result<()> {
        let user_supplied = self
            .db
            .spec
            .auth
            .as_ref()
            .is_some_and(|a| a.secret_name.is_some());
        if !self.db.auth_enabled() || user_supplied {
            return Ok(());
        }

        let secret = secret::generate_auth_secret(self.db);
        if create_if_absent(&self.api::<Secret>(), &secret).await? {
            info!(name = %secret.name_any(), "Created auth secret");
        }
        Ok(())
    }

    pub async fn ensure_client_service(&self) -> Result<ApplyOutcome> {
        let svc = service::generate_client_service(self.db);
        apply_owned(&self.api::<Service>(), &svc, &self.uid).await
    }

    /// StatefulSet and PDB of one node group
    ///
    /// A replica-only change is written as a merge patch of
    /// `spec.replicas` so scaling never re-renders the pod template.
    pub async fn ensure_node_group(&self, role: NodeRole, node: &NodeSpec) -> Result<ApplyOutcome> {
        let desired = statefulset::generate_statefulset(self.db, role, node, &self.ctx.config);
        let api = self.api::<StatefulSet>();
        let sts_name = desired.name_any();
        let live = api.get_opt(&sts_name).await?;

        if let Some(live) = &live {
            check_ownership(live.meta(), &self.uid, "StatefulSet")?;
        }

        let outcome = match plan_statefulset(&desired, live.as_ref())? {
            GroupChange::Unchanged => ApplyOutcome::Unchanged,
            GroupChange::Scale { from, to } => {
                let patch = serde_json::json!({ "spec": { "replicas": to } });
                api.patch(&sts_name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                info!(statefulset = %sts_name, from, to, "Scaled node group");
                self.ctx
                    .publish_normal(
                        &self.db.object_ref(&()),
                        reasons::SCALED,
                        actions::SCALE,
                        format!("Scaled StatefulSet {} from {} to {} replicas", sts_name, from, to),
                    )
                    .await;
                ApplyOutcome::Patched
            }
            GroupChange::Create | GroupChange::Patch => {
                api.patch(
                    &sts_name,
                    &PatchParams::apply(FIELD_MANAGER).force(),
                    &Patch::Apply(&desired),
                )
                .await?;
                let (outcome, reason, action, verb) = if live.is_some() {
                    info!(statefulset = %sts_name, role = %role, "Patched StatefulSet");
                    (ApplyOutcome::Patched, reasons::SUCCESSFUL_PATCH, actions::RECONCILE, "Patched")
                } else {
                    info!(statefulset = %sts_name, role = %role, "Created StatefulSet");
                    (ApplyOutcome::Created, reasons::SUCCESSFUL_CREATE, actions::CREATE, "Created")
                };
                self.ctx
                    .publish_normal(
                        &self.db.object_ref(&()),
                        reason,
                        action,
                        format!("{} StatefulSet {}", verb, sts_name),
                    )
                    .await;
                outcome
            }
        };

        self.ensure_pdb(role, node).await?;
        Ok(outcome)
    }

    async fn ensure_pdb(&self, role: NodeRole, node: &NodeSpec) -> Result<()> {
        let api = self.api::<PodDisruptionBudget>();
        match pdb::generate_pdb(self.db, role, node) {
            Some(desired) => {
                apply_owned(&api, &desired, &self.uid).await?;
            }
            None => {
                let name = statefulset_name(&self.name, role, node);
                if let Some(live) = api.get_opt(&name).await?
                    && check_ownership(live.meta(), &self.uid, "PodDisruptionBudget").is_ok()
                {
                    api.delete(&name, &DeleteParams::default()).await?;
                    info!(pdb = %name, "Deleted PodDisruptionBudget, maxUnavailable was removed");
                }
            }
        }
        Ok(())
    }

    /// Converge every derived object; true when anything changed
    pub async fn materialize(&self) -> Result<bool> {
        self.ensure_governing().await?;
        self.ensure_auth_secret().await?;
        let mut changed = self.ensure_client_service().await?.changed();

        for (role, node) in self.db.spec.shape.node_groups() {
            changed |= self.ensure_node_group(role, node).await?.changed();
        }
        Ok(changed)
    }

    /// Ready and desired pods over node groups, see [`tally_ready`]
    pub async fn readiness(&self) -> Result<(i32, i32)> {
        let pods = self.api::<Pod>();
        let mut groups = Vec::new();

        for (role, node) in self.db.spec.shape.node_groups() {
            let labels = role_labels(&self.name, role);
            let list = pods
                .list(&ListParams::default().labels(&selector(&labels)))
                .await?;
            let ready = list.items.iter().filter(|p| pod_is_ready(p)).count() as i32;
            debug!(
                name = %self.name,
                role = %role,
                ready,
                desired = node.replicas(),
                "Node group readiness"
            );
            groups.push((ready, node.replicas()));
        }
        Ok(tally_ready(&groups))
    }

    /// Poll readiness until every group is ready or `timeout` passes
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(i32, i32)> {
        let started = Instant::now();
        let poll = async {
            loop {
                let (ready, desired) = self.readiness().await?;
                if ready >= desired {
                    return Ok::<_, Error>((ready, desired));
                }
                debug!(
                    name = %self.name,
                    ready,
                    desired,
                    "Waiting for pods to become ready"
                );
                tokio::time::sleep(READY_POLL_INTERVAL).await;
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => {
                warn!(name = %self.name, ?timeout, "Pods did not become ready in time");
                Err(Error::ConvergenceTimeout {
                    what: format!("pods of Elasticsearch {}/{}", self.ns, self.name),
                    elapsed: started.elapsed(),
                })
            }
        }
    }
}
