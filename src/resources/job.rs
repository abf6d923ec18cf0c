//! Backup and restore Job generation
//!
//! Both directions run the same dump image with a `--process` flag. The job
//! reads backend credentials from the storage secret mounted read-only at
//! `/var/credentials/` and stages data on a scratch volume.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, SecretVolumeSource, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::ObjectMeta;

use crate::crd::SnapshotStorageSpec;

/// Mount path of the storage credential secret
pub const CREDENTIALS_MOUNT_PATH: &str = "/var/credentials/";

/// Label recording whether a job backs up or restores
pub const JOB_TYPE_LABEL: &str = "elasticsearch-operator.smoketurner.com/job-type";

/// Label recording the database generation a restore job was started for
pub const GENERATION_LABEL: &str = "elasticsearch-operator.smoketurner.com/generation";

/// Scratch size used when neither the snapshot nor the database declares one
pub const DEFAULT_SCRATCH_SIZE: &str = "1Gi";

/// Direction of a dump job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobProcess {
    Backup,
    Restore,
}

impl JobProcess {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobProcess::Backup => "backup",
            JobProcess::Restore => "restore",
        }
    }

    /// Where the scratch volume is mounted for this direction
    pub fn scratch_mount_path(&self) -> &'static str {
        match self {
            JobProcess::Backup => "/var/dump-backup/",
            JobProcess::Restore => "/var/dump-restore/",
        }
    }
}

/// Name of the job backing up a snapshot
pub fn backup_job_name(snapshot: &str) -> String {
    format!("backup-{}", snapshot)
}

/// Name of the job restoring a database
pub fn restore_job_name(db_name: &str) -> String {
    format!("restore-{}", db_name)
}

/// Scratch space for a dump job
#[derive(Clone, Debug, PartialEq)]
pub enum ScratchVolume {
    /// A PVC named after the job
    Claim {
        storage_class_name: Option<String>,
        size: String,
    },
    /// An emptyDir bounded by the given size
    Ephemeral { size: Option<String> },
}

/// Everything needed to render a dump job
#[derive(Clone, Debug)]
pub struct DumpJobParams<'a> {
    pub name: String,
    pub namespace: String,
    pub process: JobProcess,
    /// Client service of the database the job talks to
    pub host: &'a str,
    /// Database whose folder holds the snapshot
    pub database: &'a str,
    pub snapshot: &'a str,
    pub storage: &'a SnapshotStorageSpec,
    pub image: String,
    pub scratch: ScratchVolume,
    pub owner: OwnerReference,
    pub labels: BTreeMap<String, String>,
}

/// Command line passed to the dump image
///
/// `host` and `database` differ when restoring a snapshot taken from
/// another database.
pub fn dump_args(
    process: JobProcess,
    host: &str,
    database: &str,
    snapshot: &str,
    storage: &SnapshotStorageSpec,
) -> Vec<String> {
    vec![
        format!("--process={}", process.as_str()),
        format!("--host={}", host),
        format!("--provider={}", storage.backend.provider()),
        format!("--bucket={}", storage.backend.bucket()),
        format!("--folder={}", storage.backend.folder(database)),
        format!("--snapshot={}", snapshot),
    ]
}

/// Generate the scratch PVC for a job, if it uses one
pub fn generate_scratch_pvc(params: &DumpJobParams<'_>) -> Option<PersistentVolumeClaim> {
    let ScratchVolume::Claim {
        storage_class_name,
        size,
    } = &params.scratch
    else {
        return None;
    };

    Some(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(params.name.clone()),
            namespace: Some(params.namespace.clone()),
            labels: Some(params.labels.clone()),
            owner_references: Some(vec![params.owner.clone()]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Generate a backup or restore Job
pub fn generate_dump_job(params: &DumpJobParams<'_>) -> Job {
    let mut labels = params.labels.clone();
    labels.insert(
        JOB_TYPE_LABEL.to_string(),
        params.process.as_str().to_string(),
    );

    let scratch_source = match &params.scratch {
        ScratchVolume::Claim { .. } => Volume {
            name: "scratch".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: params.name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        },
        ScratchVolume::Ephemeral { size } => Volume {
            name: "scratch".to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                size_limit: size.clone().map(Quantity),
                ..Default::default()
            }),
            ..Default::default()
        },
    };

    let container = Container {
        name: params.process.as_str().to_string(),
        image: Some(params.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(dump_args(
            params.process,
            params.host,
            params.database,
            params.snapshot,
            params.storage,
        )),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "cloud".to_string(),
                mount_path: CREDENTIALS_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "scratch".to_string(),
                mount_path: params.process.scratch_mount_path().to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(params.name.clone()),
            namespace: Some(params.namespace.clone()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![params.owner.clone()]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![
                        Volume {
                            name: "cloud".to_string(),
                            secret: Some(SecretVolumeSource {
                                secret_name: Some(params.storage.storage_secret_name.clone()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        scratch_source,
                    ]),
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Terminal outcome of a Job
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed(String),
}

/// Read a Job's terminal outcome, `None` while it is still running
pub fn job_outcome(job: &Job) -> Option<JobOutcome> {
    let status = job.status.as_ref()?;

    for condition in status.conditions.iter().flatten() {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Complete" => return Some(JobOutcome::Succeeded),
            "Failed" => {
                let reason = condition
                    .message
                    .clone()
                    .or_else(|| condition.reason.clone())
                    .unwrap_or_else(|| "Job failed".to_string());
                return Some(JobOutcome::Failed(reason));
            }
            _ => {}
        }
    }

    if status.succeeded.unwrap_or(0) > 0 {
        return Some(JobOutcome::Succeeded);
    }
    // backoffLimit is 0, so a single failed pod is final
    if status.failed.unwrap_or(0) > 0 {
        return Some(JobOutcome::Failed("Job pod failed".to_string()));
    }
    None
}
