use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Elasticsearch is the Schema for the elasticsearches API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "elasticsearch-operator.smoketurner.com",
    version = "v1alpha1",
    kind = "Elasticsearch",
    plural = "elasticsearches",
    shortname = "es",
    namespaced,
    status = "ElasticsearchStatus",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchSpec {
    /// Elasticsearch version (e.g., "7.9")
    pub version: String,

    /// Cluster shape: either a single flat node group or a multi-role topology
    #[serde(flatten)]
    pub shape: ClusterShape,

    /// Whether data lives on persistent volumes or on ephemeral pod storage
    #[serde(default)]
    pub storage_type: StorageType,

    /// What happens to derived resources when the database is deleted
    ///
    /// Unset means Pause, or Delete for ephemeral storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_policy: Option<TerminationPolicy>,

    /// TLS configuration for node transport and HTTP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSpec>,

    /// Authentication configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthSpec>,

    /// Prometheus exporter sidecar configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<MonitorSpec>,

    /// Scheduled backups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_schedule: Option<BackupScheduleSpec>,

    /// Initialize the database from an existing snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<InitSpec>,

    /// ServiceAccount used by database pods (defaults to the governing service account)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// StatefulSet update strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<UpdateStrategy>,

    /// Node selector for database pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Extra environment variables for the database container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVarSpec>,

    /// ConfigMap holding custom elasticsearch configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_source: Option<String>,
}

/// Mutually exclusive cluster shapes
///
/// Serialized as either a `flat` or a `topology` key on the spec.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ClusterShape {
    /// One node group holding every role
    Flat(NodeSpec),
    /// Dedicated node groups per role
    Topology(TopologySpec),
}

impl ClusterShape {
    /// Node groups in materialization order, paired with their role
    pub fn node_groups(&self) -> Vec<(NodeRole, &NodeSpec)> {
        match self {
            ClusterShape::Flat(node) => vec![(NodeRole::Combined, node)],
            ClusterShape::Topology(topology) => {
                let mut groups = vec![
                    (NodeRole::Master, &topology.master),
                    (NodeRole::Data, &topology.data),
                ];
                if let Some(warm) = &topology.warm {
                    groups.push((NodeRole::Warm, warm));
                }
                groups.push((NodeRole::Client, &topology.client));
                groups
            }
        }
    }

    /// Mutable access to every node group, used for defaulting
    pub fn node_groups_mut(&mut self) -> Vec<&mut NodeSpec> {
        match self {
            ClusterShape::Flat(node) => vec![node],
            ClusterShape::Topology(topology) => {
                let mut groups = vec![&mut topology.master, &mut topology.data];
                if let Some(warm) = topology.warm.as_mut() {
                    groups.push(warm);
                }
                groups.push(&mut topology.client);
                groups
            }
        }
    }

    /// Total desired replicas across all node groups
    pub fn total_replicas(&self) -> i32 {
        self.node_groups()
            .iter()
            .map(|(_, node)| node.replicas())
            .sum()
    }

    /// Storage request of the group holding data (flat or data role)
    pub fn data_storage(&self) -> Option<&StorageSpec> {
        match self {
            ClusterShape::Flat(node) => node.storage.as_ref(),
            ClusterShape::Topology(topology) => topology.data.storage.as_ref(),
        }
    }

    pub fn is_topology(&self) -> bool {
        matches!(self, ClusterShape::Topology(_))
    }
}

/// Dedicated node groups
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TopologySpec {
    /// Master-eligible nodes
    pub master: NodeSpec,
    /// Hot data nodes
    pub data: NodeSpec,
    /// Warm data nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warm: Option<NodeSpec>,
    /// Coordinating nodes serving client traffic
    pub client: NodeSpec,
}

/// Configuration for a single node group
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// Number of pods in this group (defaults to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// StatefulSet name prefix (topology only; defaults to the role name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Storage for this group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,

    /// Compute resources for this group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Maximum pods of this group that may be voluntarily disrupted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<i32>,
}

impl NodeSpec {
    pub fn replicas(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }

    pub fn memory_request(&self) -> Option<&str> {
        self.resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.memory.as_deref())
    }
}

/// Role played by a node group
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeRole {
    /// Flat clusters: every node holds every role
    Combined,
    Master,
    Data,
    Warm,
    Client,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Combined => "combined",
            NodeRole::Master => "master",
            NodeRole::Data => "data",
            NodeRole::Warm => "warm",
            NodeRole::Client => "client",
        }
    }

    pub fn is_master_eligible(&self) -> bool {
        matches!(self, NodeRole::Combined | NodeRole::Master)
    }

    pub fn holds_data(&self) -> bool {
        matches!(self, NodeRole::Combined | NodeRole::Data | NodeRole::Warm)
    }

    pub fn serves_clients(&self) -> bool {
        matches!(self, NodeRole::Combined | NodeRole::Client)
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage configuration for a node group
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Storage class name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Requested capacity (e.g., "1Gi")
    pub size: String,

    /// Access modes (defaults to ReadWriteOnce)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,
}

/// Where node data is stored
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum StorageType {
    /// PersistentVolumeClaims survive pod restarts
    #[default]
    Durable,
    /// Size-bounded emptyDir; data is lost with the pod
    Ephemeral,
}

/// Behaviour on deletion of the Elasticsearch resource
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum TerminationPolicy {
    /// Deletion is rejected at admission
    DoNotTerminate,
    /// Keep workloads and data, record a DormantDatabase for later resume
    #[default]
    Pause,
    /// Remove workloads and volumes, keep secrets and snapshots
    Delete,
    /// Remove everything including secrets and snapshot data
    WipeOut,
}

impl std::fmt::Display for TerminationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationPolicy::DoNotTerminate => write!(f, "DoNotTerminate"),
            TerminationPolicy::Pause => write!(f, "Pause"),
            TerminationPolicy::Delete => write!(f, "Delete"),
            TerminationPolicy::WipeOut => write!(f, "WipeOut"),
        }
    }
}

impl ElasticsearchSpec {
    /// Policy in effect, resolving an unset field by storage type
    pub fn termination_policy(&self) -> TerminationPolicy {
        self.termination_policy.unwrap_or(match self.storage_type {
            StorageType::Ephemeral => TerminationPolicy::Delete,
            StorageType::Durable => TerminationPolicy::Pause,
        })
    }
}

/// Resource requirements for database pods
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    /// CPU and memory limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,

    /// CPU and memory requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
}

/// Resource quantities for CPU and memory
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
pub struct ResourceList {
    /// CPU quantity (e.g., "500m", "2")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory quantity (e.g., "512Mi", "2Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// TLS configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    /// Enable TLS
    pub enabled: bool,

    /// Secret containing the node certificates (defaults to `<name>-cert`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_secret: Option<String>,
}

/// Authentication configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuthSpec {
    /// Enable the authentication plugin
    pub enabled: bool,

    /// Secret with ADMIN_USERNAME/ADMIN_PASSWORD (generated as `<name>-auth` if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

/// Monitoring configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSpec {
    /// Run the exporter sidecar
    pub enabled: bool,

    /// Exporter listen port (defaulted at admission)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

/// Default exporter port assigned when monitoring is enabled without one
pub const DEFAULT_EXPORTER_PORT: i32 = 56790;

impl MonitorSpec {
    pub fn port(&self) -> i32 {
        self.port.unwrap_or(DEFAULT_EXPORTER_PORT)
    }
}

/// Scheduled backup configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupScheduleSpec {
    /// Cron expression (5/6/7 fields, `@daily`-style macros or `@every 6h`)
    pub cron_expression: String,

    /// Where snapshots are stored
    pub storage: SnapshotStorageSpec,
}

/// Object storage backend descriptor shared by schedules and snapshots
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStorageSpec {
    /// Secret holding backend credentials
    pub storage_secret_name: String,

    /// Backend location
    #[serde(flatten)]
    pub backend: StorageBackend,
}

/// Object storage backend
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(tag = "type")]
pub enum StorageBackend {
    /// Amazon S3 or an S3-compatible endpoint
    S3 {
        bucket: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },
    /// Google Cloud Storage
    GCS {
        bucket: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },
    /// Azure Blob Storage; `bucket` names the container
    Azure {
        bucket: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },
}

impl StorageBackend {
    /// Provider name passed to backup jobs
    pub fn provider(&self) -> &'static str {
        match self {
            StorageBackend::S3 { .. } => "s3",
            StorageBackend::GCS { .. } => "gcs",
            StorageBackend::Azure { .. } => "azure",
        }
    }

    /// Bucket (or container) name
    pub fn bucket(&self) -> &str {
        match self {
            StorageBackend::S3 { bucket, .. }
            | StorageBackend::GCS { bucket, .. }
            | StorageBackend::Azure { bucket, .. } => bucket,
        }
    }

    pub fn prefix(&self) -> Option<&str> {
        match self {
            StorageBackend::S3 { prefix, .. }
            | StorageBackend::GCS { prefix, .. }
            | StorageBackend::Azure { prefix, .. } => {
                prefix.as_deref().filter(|p| !p.trim_matches('/').is_empty())
            }
        }
    }

    /// Folder inside the bucket holding all snapshots of a database
    pub fn folder(&self, database: &str) -> String {
        match self.prefix() {
            Some(prefix) => format!("{}/elasticsearch-{}", prefix.trim_matches('/'), database),
            None => format!("elasticsearch-{}", database),
        }
    }
}

/// Initialization source
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitSpec {
    /// Restore data from this snapshot before going Running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_source: Option<SnapshotSourceSpec>,
}

/// Reference to a Snapshot
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSourceSpec {
    pub name: String,
    /// Defaults to the database namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// StatefulSet update strategy
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStrategy {
    #[serde(rename = "type", default)]
    pub type_: UpdateStrategyType,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum UpdateStrategyType {
    #[default]
    RollingUpdate,
    OnDelete,
}

impl std::fmt::Display for UpdateStrategyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateStrategyType::RollingUpdate => write!(f, "RollingUpdate"),
            UpdateStrategyType::OnDelete => write!(f, "OnDelete"),
        }
    }
}

/// Literal environment variable
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct EnvVarSpec {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Status of the Elasticsearch resource
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: DatabasePhase,

    /// Why the database is in its current phase (set on failures)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Total desired pods across node groups
    #[serde(default)]
    pub replicas: i32,

    /// Ready pods across node groups
    #[serde(default)]
    pub ready_replicas: i32,

    /// Observed generation of the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Kubernetes-style conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// When the current phase was entered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_started_at: Option<String>,
}

/// Database lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum DatabasePhase {
    /// Not yet observed by the operator
    #[default]
    Pending,
    /// Validating and materializing workloads
    Creating,
    /// Restoring data from a snapshot
    Initializing,
    /// Workloads are converged and ready
    Running,
    /// Validation failed or convergence timed out
    Failed,
    /// Deletion is being processed
    Deleting,
    /// Deleted under the Pause policy; a DormantDatabase holds the spec
    Paused,
    /// Deleted under the Delete policy
    Deleted,
    /// Deleted under the WipeOut policy
    WipedOut,
}

impl DatabasePhase {
    pub fn is_deletion_outcome(&self) -> bool {
        matches!(
            self,
            DatabasePhase::Paused | DatabasePhase::Deleted | DatabasePhase::WipedOut
        )
    }
}

impl std::fmt::Display for DatabasePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabasePhase::Pending => write!(f, "Pending"),
            DatabasePhase::Creating => write!(f, "Creating"),
            DatabasePhase::Initializing => write!(f, "Initializing"),
            DatabasePhase::Running => write!(f, "Running"),
            DatabasePhase::Failed => write!(f, "Failed"),
            DatabasePhase::Deleting => write!(f, "Deleting"),
            DatabasePhase::Paused => write!(f, "Paused"),
            DatabasePhase::Deleted => write!(f, "Deleted"),
            DatabasePhase::WipedOut => write!(f, "WipedOut"),
        }
    }
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Elasticsearch {
    /// Current phase, `Pending` until the operator writes a status
    pub fn phase(&self) -> DatabasePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn auth_enabled(&self) -> bool {
        self.spec.auth.as_ref().is_some_and(|a| a.enabled)
    }

    pub fn tls_enabled(&self) -> bool {
        self.spec.tls.as_ref().is_some_and(|t| t.enabled)
    }

    pub fn snapshot_source(&self) -> Option<&SnapshotSourceSpec> {
        self.spec.init.as_ref().and_then(|i| i.snapshot_source.as_ref())
    }
}
