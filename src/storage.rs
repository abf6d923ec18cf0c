//! Object storage access for snapshot backends
//!
//! The operator itself never streams snapshot data; the dump jobs do. It
//! only needs to prove that a backend is reachable with the configured
//! credentials (admission and snapshot validation) and to remove a
//! snapshot's objects when a database is wiped out.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use tracing::{debug, info, warn};

use crate::controller::{Error, Result};
use crate::crd::{SnapshotStorageSpec, StorageBackend};

/// Secret keys holding S3 credentials
pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";

/// Secret key holding a GCS service account JSON key
pub const GOOGLE_SERVICE_ACCOUNT_JSON_KEY: &str = "GOOGLE_SERVICE_ACCOUNT_JSON_KEY";

/// Secret keys holding Azure storage credentials
pub const AZURE_ACCOUNT_NAME: &str = "AZURE_ACCOUNT_NAME";
pub const AZURE_ACCOUNT_KEY: &str = "AZURE_ACCOUNT_KEY";

/// Region used for S3 when none is configured
const DEFAULT_S3_REGION: &str = "us-east-1";

/// Operations the controllers need from a snapshot backend
#[async_trait]
pub trait SnapshotStorage: Send + Sync {
    /// Verify the bucket can be listed with the credentials in the storage secret
    async fn check_bucket_access(&self, namespace: &str, storage: &SnapshotStorageSpec)
    -> Result<()>;

    /// Delete every object of one snapshot, returning how many were removed
    async fn delete_snapshot_data(
        &self,
        namespace: &str,
        storage: &SnapshotStorageSpec,
        database: &str,
        snapshot: &str,
    ) -> Result<usize>;
}

/// Object prefix holding one snapshot: `<prefix>/elasticsearch-<db>/<snapshot>`
pub fn snapshot_prefix(backend: &StorageBackend, database: &str, snapshot: &str) -> ObjectPath {
    ObjectPath::from(format!("{}/{}", backend.folder(database), snapshot))
}

fn required<'a>(credentials: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str> {
    credentials
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::StorageError(format!("storage secret is missing key {}", key)))
}

/// Build an object store client for a backend from decoded secret data
pub fn build_store(
    backend: &StorageBackend,
    credentials: &BTreeMap<String, String>,
) -> Result<Arc<dyn ObjectStore>> {
    match backend {
        StorageBackend::S3 {
            bucket,
            region,
            endpoint,
            ..
        } => {
            use object_store::aws::AmazonS3Builder;

            let mut builder = AmazonS3Builder::new()
                .with_bucket_name(bucket)
                .with_region(region.as_deref().unwrap_or(DEFAULT_S3_REGION))
                .with_access_key_id(required(credentials, AWS_ACCESS_KEY_ID)?)
                .with_secret_access_key(required(credentials, AWS_SECRET_ACCESS_KEY)?);

            if let Some(endpoint) = endpoint.as_deref().filter(|e| !e.is_empty()) {
                builder = builder.with_endpoint(endpoint);
                if endpoint.starts_with("http://") {
                    builder = builder.with_allow_http(true);
                }
            }

            let store = builder
                .build()
                .map_err(|e| Error::StorageError(format!("Failed to create S3 client: {}", e)))?;
            Ok(Arc::new(store))
        }
        StorageBackend::GCS { bucket, .. } => {
            use object_store::gcp::GoogleCloudStorageBuilder;

            let store = GoogleCloudStorageBuilder::new()
                .with_bucket_name(bucket)
                .with_service_account_key(required(credentials, GOOGLE_SERVICE_ACCOUNT_JSON_KEY)?)
                .build()
                .map_err(|e| Error::StorageError(format!("Failed to create GCS client: {}", e)))?;
            Ok(Arc::new(store))
        }
        StorageBackend::Azure { bucket, .. } => {
            use object_store::azure::MicrosoftAzureBuilder;

            let store = MicrosoftAzureBuilder::new()
                .with_account(required(credentials, AZURE_ACCOUNT_NAME)?)
                .with_access_key(required(credentials, AZURE_ACCOUNT_KEY)?)
                .with_container_name(bucket)
                .build()
                .map_err(|e| {
                    Error::StorageError(format!("Failed to create Azure Blob client: {}", e))
                })?;
            Ok(Arc::new(store))
        }
    }
}

/// List a prefix to prove access; a missing prefix still counts as reachable
pub async fn list_prefix(store: &dyn ObjectStore, prefix: Option<&str>) -> Result<()> {
    let prefix = prefix.map(|p| ObjectPath::from(p.trim_matches('/')));
    match store.list_with_delimiter(prefix.as_ref()).await {
        Ok(_) => Ok(()),
        Err(object_store::Error::NotFound { .. }) => {
            debug!("Bucket accessible (prefix may not exist yet)");
            Ok(())
        }
        Err(e) => Err(Error::StorageError(e.to_string())),
    }
}

/// Delete every object under a prefix
pub async fn delete_prefix(store: &dyn ObjectStore, prefix: &ObjectPath) -> Result<usize> {
    let objects: Vec<_> = store
        .list(Some(prefix))
        .try_collect()
        .await
        .map_err(|e| Error::StorageError(e.to_string()))?;

    let mut deleted = 0;
    for object in objects {
        match store.delete(&object.location).await {
            Ok(()) => deleted += 1,
            Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => return Err(Error::StorageError(e.to_string())),
        }
    }
    Ok(deleted)
}

/// Snapshot storage backed by real object stores, credentials read from Secrets
#[derive(Clone)]
pub struct ObjectStorage {
    client: Client,
}

impl ObjectStorage {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn credentials(
        &self,
        namespace: &str,
        secret_name: &str,
    ) -> Result<BTreeMap<String, String>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = secrets.get_opt(secret_name).await?.ok_or_else(|| {
            Error::NotFound(format!("storage secret {}/{}", namespace, secret_name))
        })?;

        let mut data = BTreeMap::new();
        for (key, value) in secret.data.unwrap_or_default() {
            data.insert(key, String::from_utf8_lossy(&value.0).into_owned());
        }
        // stringData is write-only on the server, but fake clients return it
        for (key, value) in secret.string_data.unwrap_or_default() {
            data.entry(key).or_insert(value);
        }
        Ok(data)
    }

    async fn store(
        &self,
        namespace: &str,
        storage: &SnapshotStorageSpec,
    ) -> Result<Arc<dyn ObjectStore>> {
        let credentials = self
            .credentials(namespace, &storage.storage_secret_name)
            .await?;
        build_store(&storage.backend, &credentials)
    }
}

#[async_trait]
impl SnapshotStorage for ObjectStorage {
    async fn check_bucket_access(
        &self,
        namespace: &str,
        storage: &SnapshotStorageSpec,
    ) -> Result<()> {
        let store = self.store(namespace, storage).await?;
        list_prefix(store.as_ref(), storage.backend.prefix())
            .await
            .map_err(|e| {
                warn!(
                    bucket = %storage.backend.bucket(),
                    secret = %storage.storage_secret_name,
                    error = %e,
                    "Bucket access check failed"
                );
                Error::StorageError(format!(
                    "Fail to access bucket \"{}\" using Secret \"{}.{}\": {}",
                    storage.backend.bucket(),
                    storage.storage_secret_name,
                    namespace,
                    e
                ))
            })
    }

    async fn delete_snapshot_data(
        &self,
        namespace: &str,
        storage: &SnapshotStorageSpec,
        database: &str,
        snapshot: &str,
    ) -> Result<usize> {
        let store = self.store(namespace, storage).await?;
        let prefix = snapshot_prefix(&storage.backend, database, snapshot);
        let deleted = delete_prefix(store.as_ref(), &prefix).await?;
        info!(
            bucket = %storage.backend.bucket(),
            prefix = %prefix,
            deleted,
            "Deleted snapshot data"
        );
        Ok(deleted)
    }
}
