//! Unit tests for resource generation

use crate::common::*;
use elasticsearch_operator::config::OperatorConfig;
use elasticsearch_operator::crd::{NodeRole, StorageBackend, TerminationPolicy};
use elasticsearch_operator::resources::common::{
    DATABASE_LABEL, ROLE_LABEL, heap_size_bytes, parse_quantity, statefulset_name,
};
use elasticsearch_operator::resources::job::{
    DumpJobParams, JobOutcome, JobProcess, ScratchVolume, dump_args, generate_dump_job,
    generate_scratch_pvc, job_outcome,
};
use elasticsearch_operator::resources::{pdb, secret, service, statefulset};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::EnvVar;

fn env_value<'a>(vars: &'a [EnvVar], name: &str) -> Option<&'a str> {
    vars.iter()
        .find(|e| e.name == name)
        .and_then(|e| e.value.as_deref())
}

fn database_env(sts: &StatefulSet) -> Vec<EnvVar> {
    sts.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
        .env
        .clone()
        .unwrap()
}

fn statefulsets(db: &elasticsearch_operator::crd::Elasticsearch) -> Vec<StatefulSet> {
    let config = OperatorConfig::default();
    db.spec
        .shape
        .node_groups()
        .into_iter()
        .map(|(role, node)| statefulset::generate_statefulset(db, role, node, &config))
        .collect()
}

mod statefulset_tests {
    use super::*;

    #[test]
    fn test_flat_cluster_has_one_statefulset_named_after_database() {
        let db = create_test_database("es1", "default", 3);
        let sets = statefulsets(&db);

        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].metadata.name.as_deref(), Some("es1"));
        assert_eq!(sets[0].spec.as_ref().unwrap().replicas, Some(3));
    }

    #[test]
    fn test_topology_statefulsets_are_prefixed_by_role() {
        let db = ElasticsearchBuilder::topology("es1", "default")
            .with_warm(1)
            .with_storage("1Gi", Some("standard"))
            .build();
        let names: Vec<String> = statefulsets(&db)
            .iter()
            .map(|s| s.metadata.name.clone().unwrap())
            .collect();

        assert_eq!(
            names,
            vec!["master-es1", "data-es1", "warm-es1", "client-es1"]
        );
    }

    #[test]
    fn test_custom_prefix() {
        let mut node = node(1);
        node.prefix = Some("hot".to_string());
        assert_eq!(statefulset_name("es1", NodeRole::Data, &node), "hot-es1");
    }

    #[test]
    fn test_statefulset_uses_governing_service_and_owner() {
        let db = create_test_database("es1", "default", 1);
        let sts = &statefulsets(&db)[0];
        let spec = sts.spec.as_ref().unwrap();

        assert_eq!(serde_json::to_value(spec).unwrap()["serviceName"], "kubedb");
        let owner = &sts.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "Elasticsearch");
        assert_eq!(owner.uid, "test-uid-12345");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn test_role_flags_in_environment() {
        let db = create_test_topology("es1", "default");
        let sets = statefulsets(&db);

        let master = database_env(&sets[0]);
        assert_eq!(env_value(&master, "NODE_MASTER"), Some("true"));
        assert_eq!(env_value(&master, "NODE_DATA"), Some("false"));
        assert_eq!(env_value(&master, "NUMBER_OF_MASTERS"), Some("2"));

        let data = database_env(&sets[1]);
        assert_eq!(env_value(&data, "NODE_DATA"), Some("true"));
        assert_eq!(env_value(&data, "NODE_TAG"), Some("hot"));

        let client = database_env(&sets[2]);
        assert_eq!(env_value(&client, "HTTP_ENABLE"), Some("true"));
        assert_eq!(env_value(&client, "NODE_MASTER"), Some("false"));
    }

    #[test]
    fn test_heap_is_half_of_memory_request() {
        let db = ElasticsearchBuilder::flat("es1", "default")
            .with_memory("1Gi")
            .build();
        let env = database_env(&statefulsets(&db)[0]);

        assert_eq!(
            env_value(&env, "ES_JAVA_OPTS"),
            Some("-Xms536870912 -Xmx536870912")
        );
    }

    #[test]
    fn test_durable_storage_gets_claim_template() {
        let db = create_test_database("es1", "default", 1);
        let spec = statefulsets(&db)[0].spec.clone().unwrap();

        let claims = spec.volume_claim_templates.unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].metadata.name.as_deref(), Some("data"));
        assert_eq!(
            claims[0].spec.as_ref().unwrap().storage_class_name.as_deref(),
            Some("standard")
        );
    }

    #[test]
    fn test_ephemeral_storage_uses_empty_dir() {
        let db = ElasticsearchBuilder::flat("es1", "default")
            .with_storage("1Gi", None)
            .ephemeral()
            .with_termination_policy(TerminationPolicy::Delete)
            .build();
        let spec = statefulsets(&db)[0].spec.clone().unwrap();

        assert!(spec.volume_claim_templates.is_none());
        let volumes = spec.template.spec.unwrap().volumes.unwrap();
        let data = volumes.iter().find(|v| v.name == "data").unwrap();
        assert!(data.empty_dir.is_some());
    }

    #[test]
    fn test_exporter_sidecar_only_on_client_group() {
        let db = ElasticsearchBuilder::topology("es1", "default")
            .with_monitor()
            .build();
        let sets = statefulsets(&db);

        let containers = |sts: &StatefulSet| {
            sts.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers.len()
        };
        assert_eq!(containers(&sets[0]), 1);
        assert_eq!(containers(&sets[2]), 2);
    }

    #[test]
    fn test_tls_mounts_cert_secret() {
        let db = ElasticsearchBuilder::flat("es1", "default").with_tls().build();
        let pod = statefulsets(&db)[0]
            .spec
            .clone()
            .unwrap()
            .template
            .spec
            .unwrap();

        let certs = pod
            .volumes
            .unwrap()
            .into_iter()
            .find(|v| v.name == "certs")
            .unwrap();
        assert_eq!(certs.secret.unwrap().secret_name.as_deref(), Some("es1-cert"));
        assert_eq!(env_value(&pod.containers[0].env.clone().unwrap(), "SSL_ENABLE"), Some("true"));
    }
}

mod service_tests {
    use super::*;

    #[test]
    fn test_client_service_selects_client_role_in_topology() {
        let db = create_test_topology("es1", "default");
        let svc = service::generate_client_service(&db);
        let selector = svc.spec.unwrap().selector.unwrap();

        assert_eq!(selector.get(ROLE_LABEL).map(String::as_str), Some("client"));
        assert_eq!(selector.get(DATABASE_LABEL).map(String::as_str), Some("es1"));
    }

    #[test]
    fn test_governing_service_is_headless() {
        let svc = service::generate_governing_service("kubedb", "default");
        let spec = svc.spec.unwrap();

        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
        assert!(svc.metadata.owner_references.is_none());
    }
}

mod pdb_tests {
    use super::*;

    #[test]
    fn test_pdb_only_for_groups_with_max_unavailable() {
        let db = create_test_database("es1", "default", 3);
        let (role, node) = db.spec.shape.node_groups()[0];
        assert!(pdb::generate_pdb(&db, role, node).is_none());

        let db = ElasticsearchBuilder::flat("es1", "default")
            .with_replicas(3)
            .with_max_unavailable(1)
            .build();
        let (role, node) = db.spec.shape.node_groups()[0];
        let pdb = pdb::generate_pdb(&db, role, node).unwrap();
        assert_eq!(pdb.metadata.name.as_deref(), Some("es1"));
    }
}

mod secret_tests {
    use super::*;

    #[test]
    fn test_auth_secret_has_credentials() {
        let db = ElasticsearchBuilder::flat("es1", "default").with_auth().build();
        let secret = secret::generate_auth_secret(&db);

        assert_eq!(secret.metadata.name.as_deref(), Some("es1-auth"));
        let data = secret.string_data.unwrap();
        assert_eq!(data.get("ADMIN_USERNAME").map(String::as_str), Some("admin"));
        assert!(data.get("ADMIN_PASSWORD").is_some_and(|p| !p.is_empty()));
    }
}

mod job_tests {
    use super::*;

    #[test]
    fn test_dump_args_use_database_folder() {
        let storage = s3_storage("snapshots");
        let args = dump_args(JobProcess::Restore, "es2", "es1", "snap-1", &storage);

        assert!(args.contains(&"--process=restore".to_string()));
        assert!(args.contains(&"--host=es2".to_string()));
        assert!(args.contains(&"--folder=elasticsearch-es1".to_string()));
        assert!(args.contains(&"--provider=s3".to_string()));
    }

    #[test]
    fn test_folder_honours_prefix() {
        let backend = StorageBackend::GCS {
            bucket: "b".to_string(),
            prefix: Some("/team/".to_string()),
        };
        assert_eq!(backend.folder("es1"), "team/elasticsearch-es1");
    }

    #[test]
    fn test_backup_job_with_scratch_claim() {
        let db = create_test_database("es1", "default", 1);
        let storage = s3_storage("snapshots");
        let params = DumpJobParams {
            name: "backup-snap-1".to_string(),
            namespace: "default".to_string(),
            process: JobProcess::Backup,
            host: "es1",
            database: "es1",
            snapshot: "snap-1",
            storage: &storage,
            image: "kubedb/elasticdump:7.9".to_string(),
            scratch: ScratchVolume::Claim {
                storage_class_name: Some("standard".to_string()),
                size: "1Gi".to_string(),
            },
            owner: elasticsearch_operator::resources::owner_reference(&db),
            labels: Default::default(),
        };

        let pvc = generate_scratch_pvc(&params).unwrap();
        assert_eq!(pvc.metadata.name.as_deref(), Some("backup-snap-1"));

        let job = generate_dump_job(&params);
        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
    }

    #[test]
    fn test_job_outcome() {
        let running = Job {
            status: Some(JobStatus::default()),
            ..Default::default()
        };
        assert_eq!(job_outcome(&running), None);

        let failed = Job {
            status: Some(JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: "Failed".to_string(),
                    status: "True".to_string(),
                    message: Some("BackoffLimitExceeded".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            job_outcome(&failed),
            Some(JobOutcome::Failed("BackoffLimitExceeded".to_string()))
        );

        let complete = Job {
            status: Some(JobStatus {
                succeeded: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(job_outcome(&complete), Some(JobOutcome::Succeeded));
    }
}

mod quantity_tests {
    use super::*;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("1Gi"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_quantity("512Mi"), Some(512 * 1024 * 1024));
        assert_eq!(parse_quantity("1G"), Some(1_000_000_000));
        assert_eq!(parse_quantity("100"), Some(100));
        assert_eq!(parse_quantity("lots"), None);
        assert_eq!(parse_quantity(""), None);
    }

    #[test]
    fn test_heap_defaults_without_memory_request() {
        assert_eq!(heap_size_bytes(&node(1)), 128 * 1024 * 1024);
    }
}
