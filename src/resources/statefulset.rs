//! StatefulSet generation for Elasticsearch node groups
//!
//! Each node group (the single flat group, or one of master/data/warm/client
//! in a topology) becomes one StatefulSet. The generated object is a pure
//! function of the database spec, the role and the operator configuration so
//! that repeated materialization of the same spec is idempotent.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
    EnvVarSource, ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec,
    PodTemplateSpec, ResourceRequirements, SecretKeySelector, SecretVolumeSource, SecurityContext,
    Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::config::OperatorConfig;
use crate::crd::{
    Elasticsearch, NodeRole, NodeSpec, ResourceRequirements as SpecResources, StorageType,
};
use crate::resources::common::{
    HTTP_PORT, TRANSPORT_PORT, auth_secret_name, cert_secret_name, heap_size_bytes, owner_reference,
    role_labels, statefulset_name,
};

/// Name of the database container
pub const DATABASE_CONTAINER: &str = "elasticsearch";

/// Name of the metrics sidecar container
pub const EXPORTER_CONTAINER: &str = "exporter";

/// Mount path of the data volume
pub const DATA_MOUNT_PATH: &str = "/data";

/// Mount path of the TLS certificate secret
pub const CERT_MOUNT_PATH: &str = "/elasticsearch/config/certs";

/// Mount path of the user configuration ConfigMap
pub const CONFIG_MOUNT_PATH: &str = "/elasticsearch/custom-config";

/// Key of the certificate passphrase in the TLS secret
pub const KEY_PASS_KEY: &str = "key_pass";

fn env(name: &str, value: impl ToString) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Role flags and heap settings for a node group
pub fn role_env(role: NodeRole, node: &NodeSpec) -> Vec<EnvVar> {
    let (master, data, ingest, http) = match role {
        NodeRole::Combined => (true, true, true, true),
        NodeRole::Master => (true, false, false, false),
        NodeRole::Data | NodeRole::Warm => (false, true, false, false),
        NodeRole::Client => (false, false, true, true),
    };

    let mut vars = vec![
        env("NODE_MASTER", master),
        env("NODE_DATA", data),
        env("NODE_INGEST", ingest),
        env("HTTP_ENABLE", http),
    ];

    match role {
        NodeRole::Data => vars.push(env("NODE_TAG", "hot")),
        NodeRole::Warm => vars.push(env("NODE_TAG", "warm")),
        NodeRole::Combined | NodeRole::Client => vars.push(env("MODE", "client")),
        NodeRole::Master => {}
    }

    if role.is_master_eligible() {
        vars.push(env("NUMBER_OF_MASTERS", node.replicas() / 2 + 1));
    }

    let heap = heap_size_bytes(node);
    vars.push(env("ES_JAVA_OPTS", format!("-Xms{} -Xmx{}", heap, heap)));
    vars
}

/// Environment shared by every node of a database
fn common_env(db: &Elasticsearch, config: &OperatorConfig) -> Vec<EnvVar> {
    let name = db.name_any();
    let mut vars = vec![
        env("CLUSTER_NAME", &name),
        EnvVar {
            name: "NODE_NAME".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.name".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        env("DISCOVERY_SERVICE", &config.governing_service),
        env("SSL_ENABLE", db.tls_enabled()),
    ];

    if db.tls_enabled() {
        let secret = tls_secret(db);
        vars.push(secret_env("KEY_PASS", &secret, KEY_PASS_KEY));
    }

    vars.push(env("AUTH_ENABLED", db.auth_enabled()));
    if let Some(secret) = auth_secret(db) {
        vars.push(secret_env("ADMIN_USERNAME", &secret, "ADMIN_USERNAME"));
        vars.push(secret_env("ADMIN_PASSWORD", &secret, "ADMIN_PASSWORD"));
    }

    vars
}

/// TLS secret name of a database
pub fn tls_secret(db: &Elasticsearch) -> String {
    db.spec
        .tls
        .as_ref()
        .and_then(|t| t.cert_secret.clone())
        .unwrap_or_else(|| cert_secret_name(&db.name_any()))
}

/// Auth secret name of a database, if auth is enabled
pub fn auth_secret(db: &Elasticsearch) -> Option<String> {
    if !db.auth_enabled() {
        return None;
    }
    Some(
        db.spec
            .auth
            .as_ref()
            .and_then(|a| a.secret_name.clone())
            .unwrap_or_else(|| auth_secret_name(&db.name_any())),
    )
}

/// Convert spec resources into the Kubernetes representation
pub fn resource_requirements(resources: &SpecResources) -> ResourceRequirements {
    let to_map = |list: &crate::crd::ResourceList| {
        let mut map = BTreeMap::new();
        if let Some(cpu) = &list.cpu {
            map.insert("cpu".to_string(), Quantity(cpu.clone()));
        }
        if let Some(memory) = &list.memory {
            map.insert("memory".to_string(), Quantity(memory.clone()));
        }
        map
    };
    ResourceRequirements {
        limits: resources.limits.as_ref().map(to_map),
        requests: resources.requests.as_ref().map(to_map),
        ..Default::default()
    }
}

/// Size bound of a node group's data volume
fn storage_size(node: &NodeSpec) -> Option<String> {
    node.storage.as_ref().map(|s| s.size.clone())
}

fn volume_claim_template(
    node: &NodeSpec,
    labels: &BTreeMap<String, String>,
) -> Option<PersistentVolumeClaim> {
    let storage = node.storage.as_ref()?;
    let access_modes = if storage.access_modes.is_empty() {
        vec!["ReadWriteOnce".to_string()]
    } else {
        storage.access_modes.clone()
    };

    Some(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some("data".to_string()),
            // Lets Delete and WipeOut find the claims by database label
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(access_modes),
            storage_class_name: storage.storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn empty_dir(size: Option<String>) -> EmptyDirVolumeSource {
    EmptyDirVolumeSource {
        size_limit: size.map(Quantity),
        ..Default::default()
    }
}

fn exporter_container(db: &Elasticsearch, config: &OperatorConfig) -> Option<Container> {
    let monitor = db.spec.monitor.as_ref().filter(|m| m.enabled)?;
    let port = monitor.port();
    let scheme = if db.tls_enabled() { "https" } else { "http" };

    let mut args = vec![
        format!("--es.uri={}://localhost:{}", scheme, HTTP_PORT),
        format!("--web.listen-address=:{}", port),
    ];
    if db.tls_enabled() {
        args.push("--es.ssl-skip-verify".to_string());
    }

    Some(Container {
        name: EXPORTER_CONTAINER.to_string(),
        image: Some(config.exporter_image()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(args),
        ports: Some(vec![ContainerPort {
            container_port: port,
            name: Some("metrics".to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    })
}

/// Generate the StatefulSet for one node group
pub fn generate_statefulset(
    db: &Elasticsearch,
    role: NodeRole,
    node: &NodeSpec,
    config: &OperatorConfig,
) -> StatefulSet {
    let db_name = db.name_any();
    let name = statefulset_name(&db_name, role, node);
    let labels = role_labels(&db_name, role);
    let resources = node.resources.as_ref().map(resource_requirements);

    let mut env_vars = common_env(db, config);
    env_vars.extend(role_env(role, node));
    env_vars.extend(db.spec.env.iter().map(|e| env(&e.name, &e.value)));

    let mut ports = vec![ContainerPort {
        container_port: TRANSPORT_PORT,
        name: Some("transport".to_string()),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }];
    if role.serves_clients() {
        ports.insert(
            0,
            ContainerPort {
                container_port: HTTP_PORT,
                name: Some("http".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        );
    }

    let mut volume_mounts = vec![
        VolumeMount {
            name: "data".to_string(),
            mount_path: DATA_MOUNT_PATH.to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "temp".to_string(),
            mount_path: "/tmp".to_string(),
            ..Default::default()
        },
    ];
    let mut volumes = vec![Volume {
        name: "temp".to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }];

    if db.tls_enabled() {
        volume_mounts.push(VolumeMount {
            name: "certs".to_string(),
            mount_path: CERT_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
        volumes.push(Volume {
            name: "certs".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(tls_secret(db)),
                default_mode: Some(0o400),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    if let Some(config_source) = &db.spec.config_source {
        volume_mounts.push(VolumeMount {
            name: "custom-config".to_string(),
            mount_path: CONFIG_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
        volumes.push(Volume {
            name: "custom-config".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_source.clone(),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    // Durable storage with a declared size gets a claim template; everything
    // else runs on a size-bounded emptyDir
    let claim_template = match db.spec.storage_type {
        StorageType::Durable => volume_claim_template(node, &labels),
        StorageType::Ephemeral => None,
    };
    if claim_template.is_none() {
        volumes.push(Volume {
            name: "data".to_string(),
            empty_dir: Some(empty_dir(storage_size(node))),
            ..Default::default()
        });
    }

    let database_container = Container {
        name: DATABASE_CONTAINER.to_string(),
        image: Some(config.database_image(&db.spec.version)),
        image_pull_policy: Some("IfNotPresent".to_string()),
        env: Some(env_vars),
        ports: Some(ports),
        volume_mounts: Some(volume_mounts),
        resources: resources.clone(),
        security_context: Some(SecurityContext {
            privileged: Some(false),
            capabilities: Some(Capabilities {
                add: Some(vec!["IPC_LOCK".to_string(), "SYS_RESOURCE".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let init_container = Container {
        name: "init-sysctl".to_string(),
        image: Some(config.init_image()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![
            "sysctl".to_string(),
            "-w".to_string(),
            "vm.max_map_count=262144".to_string(),
        ]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut containers = vec![database_container];
    if role.serves_clients()
        && let Some(exporter) = exporter_container(db, config)
    {
        containers.push(exporter);
    }

    let service_account = db
        .spec
        .service_account_name
        .clone()
        .unwrap_or_else(|| config.governing_service.clone());

    let update_strategy = db.spec.update_strategy.as_ref().map(|s| StatefulSetUpdateStrategy {
        type_: Some(s.type_.to_string()),
        ..Default::default()
    });

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: db.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(db)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            service_name: config.governing_service.clone().into(),
            replicas: Some(node.replicas()),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            update_strategy,
            pod_management_policy: Some("OrderedReady".to_string()),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(service_account),
                    init_containers: Some(vec![init_container]),
                    containers,
                    volumes: Some(volumes),
                    node_selector: if db.spec.node_selector.is_empty() {
                        None
                    } else {
                        Some(db.spec.node_selector.clone())
                    },
                    termination_grace_period_seconds: Some(30),
                    ..Default::default()
                }),
            },
            volume_claim_templates: claim_template.map(|t| vec![t]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
