//! Test fixtures and builders for Elasticsearch, DormantDatabase and Snapshot resources
//!
//! A database is either flat (one node group holding every role) or a
//! topology with dedicated master, data, optional warm and client groups.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let db = create_test_database("es1", "default", 3);
//! let db = ElasticsearchBuilder::topology("es1", "default")
//!     .with_storage("1Gi", Some("standard"))
//!     .with_monitor()
//!     .build();
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use elasticsearch_operator::controller::Result;
use elasticsearch_operator::crd::{
    AuthSpec, BackupScheduleSpec, ClusterShape, DatabasePhase, DormantDatabase,
    DormantDatabaseSpec, DormantDatabaseStatus, DormantPhase, Elasticsearch, ElasticsearchSpec,
    ElasticsearchStatus, InitSpec, MonitorSpec, NodeSpec, Origin, ResourceList,
    ResourceRequirements, Snapshot, SnapshotSourceSpec, SnapshotSpec, SnapshotStorageSpec,
    StorageBackend, StorageSpec, StorageType, TerminationPolicy, TlsSpec, TopologySpec,
};
use elasticsearch_operator::admission::PlatformLookup;
use elasticsearch_operator::controller::Error;
use kube::core::ObjectMeta;

// =============================================================================
// Convenience Functions for Simple Test Cases
// =============================================================================

/// Create a flat database with durable storage
pub fn create_test_database(name: &str, namespace: &str, replicas: i32) -> Elasticsearch {
    ElasticsearchBuilder::flat(name, namespace)
        .with_replicas(replicas)
        .with_storage("1Gi", Some("standard"))
        .with_uid("test-uid-12345")
        .build()
}

/// Create a topology database with durable storage on every group
pub fn create_test_topology(name: &str, namespace: &str) -> Elasticsearch {
    ElasticsearchBuilder::topology(name, namespace)
        .with_storage("1Gi", Some("standard"))
        .with_uid("test-uid-12345")
        .build()
}

/// S3 storage descriptor used by schedules and snapshots
pub fn s3_storage(bucket: &str) -> SnapshotStorageSpec {
    SnapshotStorageSpec {
        storage_secret_name: "snap-secret".to_string(),
        backend: StorageBackend::S3 {
            bucket: bucket.to_string(),
            prefix: None,
            region: Some("us-east-1".to_string()),
            endpoint: None,
        },
    }
}

/// Node group with a replica count and nothing else
pub fn node(replicas: i32) -> NodeSpec {
    NodeSpec {
        replicas: Some(replicas),
        ..Default::default()
    }
}

// =============================================================================
// Elasticsearch Builder
// =============================================================================

/// Builder for Elasticsearch test resources
#[allow(dead_code)]
pub struct ElasticsearchBuilder {
    name: String,
    namespace: String,
    spec: ElasticsearchSpec,
    uid: Option<String>,
    generation: Option<i64>,
    status: Option<ElasticsearchStatus>,
}

#[allow(dead_code)]
impl ElasticsearchBuilder {
    fn with_shape(name: &str, namespace: &str, shape: ClusterShape) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            spec: ElasticsearchSpec {
                version: "7.9".to_string(),
                shape,
                storage_type: StorageType::Durable,
                termination_policy: Some(TerminationPolicy::Pause),
                tls: None,
                auth: None,
                monitor: None,
                backup_schedule: None,
                init: None,
                service_account_name: None,
                update_strategy: None,
                node_selector: BTreeMap::new(),
                env: Vec::new(),
                config_source: None,
            },
            uid: None,
            generation: None,
            status: None,
        }
    }

    /// Flat cluster with a single replica
    pub fn flat(name: &str, namespace: &str) -> Self {
        Self::with_shape(name, namespace, ClusterShape::Flat(node(1)))
    }

    /// Topology with 3 masters, 2 data nodes and 1 client
    pub fn topology(name: &str, namespace: &str) -> Self {
        Self::with_shape(
            name,
            namespace,
            ClusterShape::Topology(TopologySpec {
                master: node(3),
                data: node(2),
                warm: None,
                client: node(1),
            }),
        )
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.spec.version = version.to_string();
        self
    }

    /// Replica count of every node group
    pub fn with_replicas(mut self, replicas: i32) -> Self {
        for node in self.spec.shape.node_groups_mut() {
            node.replicas = Some(replicas);
        }
        self
    }

    pub fn with_warm(mut self, replicas: i32) -> Self {
        if let ClusterShape::Topology(topology) = &mut self.spec.shape {
            topology.warm = Some(node(replicas));
        }
        self
    }

    /// Storage on every node group
    pub fn with_storage(mut self, size: &str, storage_class: Option<&str>) -> Self {
        for node in self.spec.shape.node_groups_mut() {
            node.storage = Some(StorageSpec {
                storage_class_name: storage_class.map(String::from),
                size: size.to_string(),
                access_modes: Vec::new(),
            });
        }
        self
    }

    /// Memory request on every node group
    pub fn with_memory(mut self, memory: &str) -> Self {
        for node in self.spec.shape.node_groups_mut() {
            node.resources = Some(ResourceRequirements {
                requests: Some(ResourceList {
                    cpu: None,
                    memory: Some(memory.to_string()),
                }),
                limits: None,
            });
        }
        self
    }

    pub fn with_max_unavailable(mut self, max_unavailable: i32) -> Self {
        for node in self.spec.shape.node_groups_mut() {
            node.max_unavailable = Some(max_unavailable);
        }
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.spec.storage_type = StorageType::Ephemeral;
        self
    }

    pub fn with_termination_policy(mut self, policy: TerminationPolicy) -> Self {
        self.spec.termination_policy = Some(policy);
        self
    }

    pub fn with_tls(mut self) -> Self {
        self.spec.tls = Some(TlsSpec {
            enabled: true,
            cert_secret: None,
        });
        self
    }

    pub fn with_auth(mut self) -> Self {
        self.spec.auth = Some(AuthSpec {
            enabled: true,
            secret_name: None,
        });
        self
    }

    pub fn with_monitor(mut self) -> Self {
        self.spec.monitor = Some(MonitorSpec {
            enabled: true,
            port: None,
        });
        self
    }

    pub fn with_backup_schedule(mut self, cron_expression: &str) -> Self {
        self.spec.backup_schedule = Some(BackupScheduleSpec {
            cron_expression: cron_expression.to_string(),
            storage: s3_storage("backups"),
        });
        self
    }

    pub fn with_snapshot_source(mut self, snapshot: &str) -> Self {
        self.spec.init = Some(InitSpec {
            snapshot_source: Some(SnapshotSourceSpec {
                name: snapshot.to_string(),
                namespace: None,
            }),
        });
        self
    }

    pub fn with_uid(mut self, uid: &str) -> Self {
        self.uid = Some(uid.to_string());
        self
    }

    pub fn with_generation(mut self, generation: i64) -> Self {
        self.generation = Some(generation);
        self
    }

    /// Status in `phase`, observed at `observed_generation`
    pub fn with_phase(mut self, phase: DatabasePhase, observed_generation: Option<i64>) -> Self {
        self.status = Some(ElasticsearchStatus {
            phase,
            observed_generation,
            ..Default::default()
        });
        self
    }

    pub fn spec(&self) -> &ElasticsearchSpec {
        &self.spec
    }

    pub fn build(self) -> Elasticsearch {
        Elasticsearch {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(self.namespace),
                uid: self.uid,
                generation: self.generation,
                ..Default::default()
            },
            spec: self.spec,
            status: self.status,
        }
    }
}

// =============================================================================
// DormantDatabase and Snapshot
// =============================================================================

/// DormantDatabase capturing `db` in `phase`
pub fn dormant_for(db: &Elasticsearch, phase: DormantPhase) -> DormantDatabase {
    DormantDatabase {
        metadata: ObjectMeta {
            name: db.metadata.name.clone(),
            namespace: db.metadata.namespace.clone(),
            ..Default::default()
        },
        spec: DormantDatabaseSpec {
            origin: Origin {
                labels: BTreeMap::new(),
                annotations: BTreeMap::new(),
                spec: db.spec.clone(),
            },
            wipe_out: false,
            resume: false,
        },
        status: Some(DormantDatabaseStatus {
            phase,
            ..Default::default()
        }),
    }
}

/// Snapshot of `database` written to an S3 bucket
pub fn create_test_snapshot(name: &str, namespace: &str, database: &str) -> Snapshot {
    Snapshot {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: SnapshotSpec {
            database_name: database.to_string(),
            storage: s3_storage("snapshots"),
            pod_volume: None,
        },
        status: None,
    }
}

// =============================================================================
// Fake platform
// =============================================================================

/// In-memory cluster facts for the admission guard
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct FakeLookup {
    pub storage_classes: Vec<String>,
    /// `(namespace, name)` pairs
    pub secrets: Vec<(String, String)>,
    pub dormant: Vec<DormantDatabase>,
    /// Error message returned by the bucket check
    pub bucket_error: Option<String>,
}

#[allow(dead_code)]
impl FakeLookup {
    /// The `standard` storage class and the `snap-secret` secret in `namespace`
    pub fn standard(namespace: &str) -> Self {
        Self {
            storage_classes: vec!["standard".to_string()],
            secrets: vec![(namespace.to_string(), "snap-secret".to_string())],
            ..Default::default()
        }
    }

    pub fn with_dormant(mut self, dormant: DormantDatabase) -> Self {
        self.dormant.push(dormant);
        self
    }

    pub fn with_bucket_error(mut self, message: &str) -> Self {
        self.bucket_error = Some(message.to_string());
        self
    }
}

#[async_trait]
impl PlatformLookup for FakeLookup {
    async fn storage_class_exists(&self, name: &str) -> Result<bool> {
        Ok(self.storage_classes.iter().any(|c| c == name))
    }

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self
            .secrets
            .iter()
            .any(|(ns, n)| ns == namespace && n == name))
    }

    async fn dormant_database(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DormantDatabase>> {
        Ok(self
            .dormant
            .iter()
            .find(|d| {
                d.metadata.namespace.as_deref() == Some(namespace)
                    && d.metadata.name.as_deref() == Some(name)
            })
            .cloned())
    }

    async fn check_bucket_access(
        &self,
        _namespace: &str,
        _storage: &SnapshotStorageSpec,
    ) -> Result<()> {
        match &self.bucket_error {
            Some(message) => Err(Error::StorageError(message.clone())),
            None => Ok(()),
        }
    }
}
