//! Lifecycle tests for Elasticsearch resources against a live cluster
//!
//! Databases use no storage class so the tests run on any cluster; data
//! lives on emptyDir volumes.

use std::time::Duration;

use crate::common::ElasticsearchBuilder;
use crate::{
    ScopedOperator, SharedTestCluster, TestNamespace, dormant_is, ensure_crds_installed,
    has_reason, is_gone, is_phase, wait_for,
};
use elasticsearch_operator::crd::{
    DatabasePhase, DormantDatabase, DormantPhase, Elasticsearch, TerminationPolicy,
};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};

const RUNNING_TIMEOUT: Duration = Duration::from_secs(300);
const SHORT_TIMEOUT: Duration = Duration::from_secs(60);

async fn setup(prefix: &str) -> (Client, TestNamespace, ScopedOperator) {
    let cluster = SharedTestCluster::get().await.expect("cluster");
    ensure_crds_installed(&cluster).await.expect("crds");
    let client = cluster.new_client().await.expect("client");
    let ns = TestNamespace::create(client.clone(), prefix)
        .await
        .expect("namespace");
    let operator = ScopedOperator::start(client.clone(), ns.name()).await;
    (client, ns, operator)
}

fn database(name: &str, ns: &str, policy: TerminationPolicy) -> Elasticsearch {
    ElasticsearchBuilder::flat(name, ns)
        .with_termination_policy(policy)
        .build()
}

#[tokio::test]
#[ignore]
async fn test_flat_database_reaches_running() {
    let (client, ns, _operator) = setup("es-running").await;
    let api: Api<Elasticsearch> = Api::namespaced(client.clone(), ns.name());

    api.create(&PostParams::default(), &database("es1", ns.name(), TerminationPolicy::Delete))
        .await
        .unwrap();
    wait_for(&api, "es1", is_phase(DatabasePhase::Running), RUNNING_TIMEOUT)
        .await
        .unwrap();

    let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), ns.name());
    assert!(statefulsets.get_opt("es1").await.unwrap().is_some());
    let services: Api<Service> = Api::namespaced(client.clone(), ns.name());
    assert!(services.get_opt("es1").await.unwrap().is_some());
    assert!(services.get_opt("kubedb").await.unwrap().is_some());

    let db = api.get("es1").await.unwrap();
    assert_eq!(db.status.unwrap().ready_replicas, 1);

    ns.cleanup().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_invalid_storage_class_fails_database() {
    let (client, ns, _operator) = setup("es-invalid").await;
    let api: Api<Elasticsearch> = Api::namespaced(client, ns.name());

    let db = ElasticsearchBuilder::flat("es1", ns.name())
        .with_storage("1Gi", Some("does-not-exist"))
        .with_termination_policy(TerminationPolicy::Delete)
        .build();
    api.create(&PostParams::default(), &db).await.unwrap();

    wait_for(&api, "es1", is_phase(DatabasePhase::Failed), SHORT_TIMEOUT)
        .await
        .unwrap();
    wait_for(&api, "es1", has_reason("does-not-exist"), SHORT_TIMEOUT)
        .await
        .unwrap();

    ns.cleanup().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_failed_database_recovers_after_spec_fix() {
    let (client, ns, _operator) = setup("es-recover").await;
    let api: Api<Elasticsearch> = Api::namespaced(client, ns.name());

    let db = ElasticsearchBuilder::flat("es1", ns.name())
        .ephemeral()
        .with_storage("lots", None)
        .with_termination_policy(TerminationPolicy::Delete)
        .build();
    api.create(&PostParams::default(), &db).await.unwrap();
    wait_for(&api, "es1", is_phase(DatabasePhase::Failed), SHORT_TIMEOUT)
        .await
        .unwrap();

    let fix = serde_json::json!({"spec": {"flat": {"storage": {"size": "1Gi"}}}});
    api.patch("es1", &PatchParams::default(), &Patch::Merge(&fix))
        .await
        .unwrap();
    wait_for(&api, "es1", is_phase(DatabasePhase::Running), RUNNING_TIMEOUT)
        .await
        .unwrap();

    ns.cleanup().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_pause_leaves_dormant_database_and_resumes() {
    let (client, ns, _operator) = setup("es-pause").await;
    let api: Api<Elasticsearch> = Api::namespaced(client.clone(), ns.name());
    let dormant: Api<DormantDatabase> = Api::namespaced(client.clone(), ns.name());

    let db = database("es1", ns.name(), TerminationPolicy::Pause);
    api.create(&PostParams::default(), &db).await.unwrap();
    wait_for(&api, "es1", is_phase(DatabasePhase::Running), RUNNING_TIMEOUT)
        .await
        .unwrap();

    api.delete("es1", &DeleteParams::default()).await.unwrap();
    wait_for(&api, "es1", is_gone(), SHORT_TIMEOUT).await.unwrap();
    wait_for(&dormant, "es1", dormant_is(DormantPhase::Paused), SHORT_TIMEOUT)
        .await
        .unwrap();

    // Workloads survive a pause
    let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), ns.name());
    assert!(statefulsets.get_opt("es1").await.unwrap().is_some());

    let resume = serde_json::json!({"spec": {"resume": true}});
    dormant
        .patch("es1", &PatchParams::default(), &Patch::Merge(&resume))
        .await
        .unwrap();
    wait_for(&api, "es1", is_phase(DatabasePhase::Running), RUNNING_TIMEOUT)
        .await
        .unwrap();
    wait_for(&dormant, "es1", is_gone(), SHORT_TIMEOUT).await.unwrap();

    ns.cleanup().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_delete_policy_removes_workloads() {
    let (client, ns, _operator) = setup("es-delete").await;
    let api: Api<Elasticsearch> = Api::namespaced(client.clone(), ns.name());

    api.create(&PostParams::default(), &database("es1", ns.name(), TerminationPolicy::Delete))
        .await
        .unwrap();
    wait_for(&api, "es1", is_phase(DatabasePhase::Running), RUNNING_TIMEOUT)
        .await
        .unwrap();

    api.delete("es1", &DeleteParams::default()).await.unwrap();
    wait_for(&api, "es1", is_gone(), SHORT_TIMEOUT).await.unwrap();

    let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), ns.name());
    wait_for(&statefulsets, "es1", is_gone(), SHORT_TIMEOUT)
        .await
        .unwrap();
    let dormant: Api<DormantDatabase> = Api::namespaced(client, ns.name());
    assert!(dormant.get_opt("es1").await.unwrap().is_none());

    ns.cleanup().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_wipe_out_leaves_no_dormant_database() {
    let (client, ns, _operator) = setup("es-wipeout").await;
    let api: Api<Elasticsearch> = Api::namespaced(client.clone(), ns.name());

    let db = ElasticsearchBuilder::flat("es1", ns.name())
        .ephemeral()
        .with_auth()
        .with_termination_policy(TerminationPolicy::WipeOut)
        .build();
    api.create(&PostParams::default(), &db).await.unwrap();
    wait_for(&api, "es1", is_phase(DatabasePhase::Running), RUNNING_TIMEOUT)
        .await
        .unwrap();

    api.delete("es1", &DeleteParams::default()).await.unwrap();
    wait_for(&api, "es1", is_gone(), SHORT_TIMEOUT).await.unwrap();

    let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), ns.name());
    wait_for(&statefulsets, "es1", is_gone(), SHORT_TIMEOUT)
        .await
        .unwrap();
    let secrets: Api<Secret> = Api::namespaced(client.clone(), ns.name());
    wait_for(&secrets, "es1-auth", is_gone(), SHORT_TIMEOUT)
        .await
        .unwrap();
    let dormant: Api<DormantDatabase> = Api::namespaced(client, ns.name());
    assert!(dormant.get_opt("es1").await.unwrap().is_none());

    ns.cleanup().await.unwrap();
}
