//! DormantDatabase controller
//!
//! A DormantDatabase is written by the Pause policy and acted on when a user
//! sets `wipeOut` or `resume`. Recreating the Elasticsearch object by hand is
//! also a resume; the Lifecycle Reconciler deletes the record once the
//! database is Running again.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Api, Resource, ResourceExt};
use tracing::{debug, info, instrument};

use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::controller::events::{actions, reasons};
use crate::controller::teardown;
use crate::crd::{
    DormantDatabase, DormantDatabaseSpec, DormantDatabaseStatus, DormantPhase, Elasticsearch,
    Origin,
};
use crate::resources::common::FIELD_MANAGER;

/// Annotations that describe the old object rather than the database
const TRANSIENT_ANNOTATIONS: &[&str] = &["kubectl.kubernetes.io/last-applied-configuration"];

/// Build the record left behind by the Pause policy
pub fn dormant_from(db: &Elasticsearch, paused_at: &str) -> DormantDatabase {
    let annotations: BTreeMap<String, String> = db
        .annotations()
        .iter()
        .filter(|(k, _)| !TRANSIENT_ANNOTATIONS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    DormantDatabase {
        metadata: ObjectMeta {
            name: Some(db.name_any()),
            namespace: db.namespace(),
            labels: Some(db.labels().clone()),
            ..Default::default()
        },
        spec: DormantDatabaseSpec {
            origin: Origin {
                labels: db.labels().clone(),
                annotations,
                spec: db.spec.clone(),
            },
            wipe_out: false,
            resume: false,
        },
        status: Some(DormantDatabaseStatus {
            phase: DormantPhase::Paused,
            paused_at: Some(paused_at.to_string()),
            ..Default::default()
        }),
    }
}

/// Build the Elasticsearch object a resume recreates
pub fn database_from(dormant: &DormantDatabase) -> Elasticsearch {
    let origin = &dormant.spec.origin;
    let mut db = Elasticsearch::new(&dormant.name_any(), origin.spec.clone());
    db.metadata.namespace = dormant.namespace();
    db.metadata.labels = Some(origin.labels.clone());
    db.metadata.annotations = Some(origin.annotations.clone());
    db
}

/// Create the DormantDatabase for a paused database
///
/// An existing record from an earlier attempt is kept as is.
pub async fn pause_database(ctx: &Context, db: &Elasticsearch) -> Result<()> {
    let ns = db.namespace().unwrap_or_default();
    let api: Api<DormantDatabase> = Api::namespaced(ctx.client.clone(), &ns);
    let dormant = dormant_from(db, &Utc::now().to_rfc3339());

    match api.create(&PostParams::default(), &dormant).await {
        Ok(_) => info!(database = %db.name_any(), "Created DormantDatabase"),
        Err(kube::Error::Api(e)) if e.code == 409 => {
            debug!(database = %db.name_any(), "DormantDatabase already exists");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    // Status is a subresource and is dropped on create
    if let Some(status) = &dormant.status {
        patch_status(&api, &db.name_any(), status).await?;
    }
    Ok(())
}

async fn patch_status(
    api: &Api<DormantDatabase>,
    name: &str,
    status: &DormantDatabaseStatus,
) -> Result<()> {
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

fn status_for(dormant: &DormantDatabase, phase: DormantPhase) -> DormantDatabaseStatus {
    DormantDatabaseStatus {
        phase,
        ..dormant.status.clone().unwrap_or_default()
    }
}

/// Reconcile a DormantDatabase
#[instrument(skip(dormant, ctx), fields(name = %dormant.name_any(), namespace = dormant.namespace().unwrap_or_default()))]
pub async fn reconcile_dormant(dormant: Arc<DormantDatabase>, ctx: Arc<Context>) -> Result<Action> {
    let ns = dormant.namespace().unwrap_or_default();
    let name = dormant.name_any();
    let started = Instant::now();

    let result = reconcile_record(&dormant, &ctx, &ns).await;
    ctx.record_reconcile(
        "DormantDatabase",
        &ns,
        &name,
        started.elapsed().as_secs_f64(),
        result.is_ok(),
    );
    if result.is_ok() {
        ctx.reset_attempts(&format!("DormantDatabase/{}/{}", ns, name));
    }
    result
}

async fn reconcile_record(dormant: &DormantDatabase, ctx: &Context, ns: &str) -> Result<Action> {
    if dormant.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let name = dormant.name_any();
    let api: Api<DormantDatabase> = Api::namespaced(ctx.client.clone(), ns);
    let phase = dormant.phase();

    if dormant.spec.wipe_out && matches!(phase, DormantPhase::Paused | DormantPhase::WipingOut) {
        if phase == DormantPhase::Paused {
            patch_status(&api, &name, &status_for(dormant, DormantPhase::WipingOut)).await?;
        }

        teardown::wipe_out(ctx, ns, &name).await?;

        let status = DormantDatabaseStatus {
            wiped_out_at: Some(Utc::now().to_rfc3339()),
            ..status_for(dormant, DormantPhase::WipedOut)
        };
        patch_status(&api, &name, &status).await?;
        ctx.publish_normal(
            &dormant.object_ref(&()),
            reasons::WIPED_OUT,
            actions::WIPE_OUT,
            format!("Wiped out paused database {}", name),
        )
        .await;

        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) | Err(kube::Error::Api(kube::error::ErrorResponse { code: 404, .. })) => {}
            Err(e) => return Err(e.into()),
        }
        info!("Wiped out DormantDatabase");
        return Ok(Action::await_change());
    }

    if dormant.spec.resume && matches!(phase, DormantPhase::Paused | DormantPhase::Resuming) {
        if phase == DormantPhase::Paused {
            patch_status(&api, &name, &status_for(dormant, DormantPhase::Resuming)).await?;
        }

        let databases: Api<Elasticsearch> = Api::namespaced(ctx.client.clone(), ns);
        match databases
            .create(&PostParams::default(), &database_from(dormant))
            .await
        {
            Ok(_) => {
                info!("Recreated Elasticsearch from DormantDatabase");
                ctx.publish_normal(
                    &dormant.object_ref(&()),
                    reasons::RESUMED,
                    actions::RESUME,
                    format!("Recreated Elasticsearch {}", name),
                )
                .await;
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!("Elasticsearch already exists, waiting for it to resume");
            }
            Err(e) => return Err(e.into()),
        }
        // The lifecycle reconciler deletes this record once Running
        return Ok(Action::requeue(Duration::from_secs(30)));
    }

    Ok(Action::await_change())
}
