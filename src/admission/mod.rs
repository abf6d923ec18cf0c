//! Admission Guard
//!
//! Defaulting and validation shared by the admission webhooks and the
//! reconcilers. Validation runs in a fixed order and stops at the first
//! failure:
//!
//! 1. `spec.version` is set
//! 2. a same-named DormantDatabase, if any, matches the incoming spec
//! 3. ephemeral storage is not combined with the Pause policy
//! 4. node groups are well formed and durable storage classes exist
//! 5. a backup schedule has a valid expression, an existing credentials
//!    secret and a reachable bucket

pub mod defaults;
pub mod origin;
pub mod rules;

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::{Api, Client, ResourceExt};
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::crd::{
    DormantDatabase, DormantPhase, Elasticsearch, ElasticsearchSpec, Snapshot,
    SnapshotStorageSpec,
};
use crate::storage::SnapshotStorage;

pub use defaults::default_spec;
pub use origin::{OriginDiff, diff_origin};

/// Cluster facts the guard needs
#[async_trait]
pub trait PlatformLookup: Send + Sync {
    async fn storage_class_exists(&self, name: &str) -> Result<bool>;

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool>;

    async fn dormant_database(&self, namespace: &str, name: &str)
    -> Result<Option<DormantDatabase>>;

    /// Live connectivity check against the bucket
    async fn check_bucket_access(&self, namespace: &str, storage: &SnapshotStorageSpec)
    -> Result<()>;
}

/// Lookups against the API server and the object store
#[derive(Clone)]
pub struct KubeLookup {
    client: Client,
    storage: Arc<dyn SnapshotStorage>,
}

impl KubeLookup {
    pub fn new(client: Client, storage: Arc<dyn SnapshotStorage>) -> Self {
        Self { client, storage }
    }
}

#[async_trait]
impl PlatformLookup for KubeLookup {
    async fn storage_class_exists(&self, name: &str) -> Result<bool> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn dormant_database(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DormantDatabase>> {
        let api: Api<DormantDatabase> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn check_bucket_access(
        &self,
        namespace: &str,
        storage: &SnapshotStorageSpec,
    ) -> Result<()> {
        self.storage.check_bucket_access(namespace, storage).await
    }
}

/// Ordered validation against the cluster
pub struct AdmissionGuard<'a> {
    lookup: &'a dyn PlatformLookup,
}

impl<'a> AdmissionGuard<'a> {
    pub fn new(lookup: &'a dyn PlatformLookup) -> Self {
        Self { lookup }
    }

    /// Validate a database spec for create or update
    pub async fn validate(&self, db: &Elasticsearch) -> Result<()> {
        let name = db.name_any();
        let namespace = db.namespace().unwrap_or_default();

        rules::validate_version(&db.spec)?;
        self.validate_dormant_origin(&namespace, &name, &db.spec)
            .await?;
        rules::validate_termination_policy(&db.spec)?;
        rules::validate_snapshot_source(&db.spec, &namespace)?;

        for class in rules::validate_node_groups(&db.spec)? {
            if !self.lookup.storage_class_exists(&class).await? {
                return Err(Error::ValidationError(format!(
                    "storage class {:?} not found",
                    class
                )));
            }
        }

        if let Some(schedule) = &db.spec.backup_schedule {
            rules::validate_backup_schedule(schedule)?;
            self.validate_storage_access(&namespace, &schedule.storage)
                .await?;
        }

        debug!(name = %name, namespace = %namespace, "Elasticsearch spec is valid");
        Ok(())
    }

    /// Validate an update, including fields that cannot change
    ///
    /// An object being deleted only loses finalizers, and an update that
    /// leaves the spec alone (labels, finalizers) needs no cluster lookups.
    pub async fn validate_update(&self, old: &Elasticsearch, new: &Elasticsearch) -> Result<()> {
        if new.metadata.deletion_timestamp.is_some() {
            debug!(name = %new.name_any(), "Elasticsearch is being deleted, skipping validation");
            return Ok(());
        }
        rules::validate_immutable(&old.spec, &new.spec)?;
        if old.spec == new.spec {
            return Ok(());
        }
        self.validate(new).await
    }

    /// Validate a deletion request against the live object
    pub fn validate_delete(&self, live: &Elasticsearch) -> Result<()> {
        rules::validate_delete(live)
    }

    /// Validate a snapshot's spec, credentials and bucket
    ///
    /// The one-running-snapshot check needs a listing and is done by the
    /// snapshot controller.
    pub async fn validate_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        rules::validate_snapshot_spec(&snapshot.spec)?;
        let namespace = snapshot.namespace().unwrap_or_default();
        self.validate_storage_access(&namespace, &snapshot.spec.storage)
            .await
    }

    async fn validate_storage_access(
        &self,
        namespace: &str,
        storage: &SnapshotStorageSpec,
    ) -> Result<()> {
        rules::validate_storage_descriptor(storage)?;
        if !self
            .lookup
            .secret_exists(namespace, &storage.storage_secret_name)
            .await?
        {
            return Err(Error::ValidationError(format!(
                "storage secret {}/{} not found",
                namespace, storage.storage_secret_name
            )));
        }
        self.lookup
            .check_bucket_access(namespace, storage)
            .await
            .map_err(|e| match e {
                Error::StorageError(message) => Error::ValidationError(message),
                other => other,
            })
    }

    async fn validate_dormant_origin(
        &self,
        namespace: &str,
        name: &str,
        spec: &ElasticsearchSpec,
    ) -> Result<()> {
        let Some(dormant) = self.lookup.dormant_database(namespace, name).await? else {
            return Ok(());
        };

        let phase = dormant.phase();
        if !phase.is_recoverable() {
            return Err(Error::ValidationError(format!(
                "DormantDatabase {}/{} is {}; wait for it to finish or delete it",
                namespace, name, phase
            )));
        }
        if phase == DormantPhase::Paused && dormant.spec.wipe_out {
            return Err(Error::ValidationError(format!(
                "DormantDatabase {}/{} is marked for wipe out",
                namespace, name
            )));
        }

        let diff = diff_origin(&dormant.spec.origin.spec, spec);
        if !diff.is_empty() {
            return Err(Error::ValidationError(format!(
                "spec does not match DormantDatabase {}/{}: {}",
                namespace, name, diff
            )));
        }
        Ok(())
    }
}
