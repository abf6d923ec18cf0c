//! Termination policy mechanics
//!
//! Shared by the Elasticsearch reconciler (Pause, Delete, WipeOut) and the
//! DormantDatabase controller (wipe out of a paused database). Every step
//! tolerates objects that are already gone so a retried teardown converges.

use std::fmt::Debug;

use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::controller::Context;
use crate::controller::error::{Error, Result};
use crate::crd::Snapshot;
use crate::resources::common::database_selector;

fn list_params(db_name: &str) -> ListParams {
    ListParams::default().labels(&database_selector(db_name))
}

/// Remove owner references so garbage collection keeps the objects
pub async fn orphan_labelled<K>(client: Client, ns: &str, db_name: &str) -> Result<usize>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client, ns);
    let patch = serde_json::json!({ "metadata": { "ownerReferences": null } });
    let mut orphaned = 0;

    for obj in api.list(&list_params(db_name)).await? {
        if obj.owner_references().is_empty() {
            continue;
        }
        match api
            .patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => orphaned += 1,
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(orphaned)
}

/// Delete every object of a kind carrying the database label
pub async fn delete_labelled<K>(client: Client, ns: &str, db_name: &str) -> Result<usize>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client, ns);
    let mut deleted = 0;

    for obj in api.list(&list_params(db_name)).await? {
        match api.delete(&obj.name_any(), &DeleteParams::background()).await {
            Ok(_) => deleted += 1,
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(deleted)
}

/// Pause: keep everything, detached from the database
pub async fn orphan_database_objects(client: &Client, ns: &str, db_name: &str) -> Result<()> {
    let sts = orphan_labelled::<StatefulSet>(client.clone(), ns, db_name).await?;
    let svc = orphan_labelled::<Service>(client.clone(), ns, db_name).await?;
    let pdb = orphan_labelled::<PodDisruptionBudget>(client.clone(), ns, db_name).await?;
    let secrets = orphan_labelled::<Secret>(client.clone(), ns, db_name).await?;
    info!(
        database = %db_name,
        statefulsets = sts,
        services = svc,
        pdbs = pdb,
        secrets,
        "Orphaned database objects"
    );
    Ok(())
}

/// Delete: workloads and volumes go, secrets stay
pub async fn delete_workloads(client: &Client, ns: &str, db_name: &str) -> Result<()> {
    let sts = delete_labelled::<StatefulSet>(client.clone(), ns, db_name).await?;
    let pdb = delete_labelled::<PodDisruptionBudget>(client.clone(), ns, db_name).await?;
    let pvc = delete_labelled::<PersistentVolumeClaim>(client.clone(), ns, db_name).await?;
    // The client Service would be collected with the database anyway
    let svc = delete_labelled::<Service>(client.clone(), ns, db_name).await?;
    // Secrets survive the owner's deletion
    orphan_labelled::<Secret>(client.clone(), ns, db_name).await?;
    info!(
        database = %db_name,
        statefulsets = sts,
        pdbs = pdb,
        pvcs = pvc,
        services = svc,
        "Deleted database workloads"
    );
    Ok(())
}

/// Whether a failed bucket cleanup may be skipped
///
/// A storage secret that is gone does not come back on retry, so the data
/// is left in the bucket and the Snapshot objects are still deleted.
pub fn skip_data_removal(err: &Error) -> bool {
    matches!(err, Error::NotFound(_))
}

/// Delete every Snapshot of a database and its data in the bucket
pub async fn delete_snapshots(ctx: &Context, ns: &str, db_name: &str) -> Result<usize> {
    let api: Api<Snapshot> = Api::namespaced(ctx.client.clone(), ns);
    let mut deleted = 0;

    let snapshots = api.list(&ListParams::default()).await?;
    for snapshot in snapshots
        .items
        .iter()
        .filter(|s| s.spec.database_name == db_name)
    {
        let name = snapshot.name_any();
        match ctx
            .storage
            .delete_snapshot_data(ns, &snapshot.spec.storage, db_name, &name)
            .await
        {
            Ok(objects) => debug!(snapshot = %name, objects, "Removed snapshot data"),
            Err(e) if skip_data_removal(&e) => {
                warn!(snapshot = %name, error = %e, "Leaving snapshot data in the bucket");
            }
            Err(e) => return Err(e),
        }

        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => deleted += 1,
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(deleted)
}

/// WipeOut: workloads, volumes, secrets, snapshots and their data
pub async fn wipe_out(ctx: &Context, ns: &str, db_name: &str) -> Result<()> {
    let client = &ctx.client;
    delete_labelled::<StatefulSet>(client.clone(), ns, db_name).await?;
    delete_labelled::<PodDisruptionBudget>(client.clone(), ns, db_name).await?;
    delete_labelled::<Service>(client.clone(), ns, db_name).await?;
    let pvc = delete_labelled::<PersistentVolumeClaim>(client.clone(), ns, db_name).await?;
    let snapshots = delete_snapshots(ctx, ns, db_name).await?;
    let secrets = delete_labelled::<Secret>(client.clone(), ns, db_name).await?;
    info!(
        database = %db_name,
        pvcs = pvc,
        secrets,
        snapshots,
        "Wiped out database"
    );
    Ok(())
}
