//! Unit tests for apply planning
//!
//! The materializer only writes what differs from the live object; these
//! tests cover the comparison and ownership rules without a cluster.

use crate::common::*;
use elasticsearch_operator::config::OperatorConfig;
use elasticsearch_operator::controller::Error;
use elasticsearch_operator::controller::materializer::{
    ApplyOutcome, GroupChange, check_ownership, is_json_subset, plan_apply, plan_statefulset,
    tally_ready,
};
use elasticsearch_operator::resources::{owner_reference, service, statefulset};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::ObjectMeta;
use serde_json::json;

fn desired_statefulset(replicas: i32) -> StatefulSet {
    let db = create_test_database("es1", "default", replicas);
    let (role, node) = db.spec.shape.node_groups()[0];
    statefulset::generate_statefulset(&db, role, node, &OperatorConfig::default())
}

mod subset_tests {
    use super::*;

    #[test]
    fn test_server_defaults_ignored() {
        let desired = json!({"spec": {"replicas": 3}});
        let live = json!({"spec": {"replicas": 3, "revisionHistoryLimit": 10}, "status": {}});
        assert!(is_json_subset(&desired, &live));
    }

    #[test]
    fn test_changed_value_detected() {
        let desired = json!({"spec": {"replicas": 3}});
        let live = json!({"spec": {"replicas": 2}});
        assert!(!is_json_subset(&desired, &live));
    }

    #[test]
    fn test_arrays_compared_element_wise() {
        let desired = json!({"ports": [{"port": 9200}]});
        assert!(is_json_subset(&desired, &json!({"ports": [{"port": 9200, "protocol": "TCP"}]})));
        assert!(!is_json_subset(&desired, &json!({"ports": [{"port": 9200}, {"port": 9300}]})));
    }

    #[test]
    fn test_quantities_compared_by_amount() {
        let desired = json!({"resources": {"requests": {"memory": "1.5Gi", "cpu": "0.5"}}});
        let live = json!({"resources": {"requests": {"memory": "1536Mi", "cpu": "500m"}}});
        assert!(is_json_subset(&desired, &live));

        // Outside quantity fields strings must match exactly
        assert!(!is_json_subset(&json!({"image": "7.9"}), &json!({"image": "7.90"})));
    }

    #[test]
    fn test_empty_values_match_absent() {
        let desired = json!({"metadata": {"annotations": {}}, "items": []});
        assert!(is_json_subset(&desired, &json!({"metadata": {}})));
    }
}

mod plan_tests {
    use super::*;

    #[test]
    fn test_plan_apply() {
        let db = create_test_database("es1", "default", 1);
        let desired = service::generate_client_service(&db);

        assert_eq!(plan_apply(&desired, None).unwrap(), ApplyOutcome::Created);
        assert_eq!(
            plan_apply(&desired, Some(&desired)).unwrap(),
            ApplyOutcome::Unchanged
        );

        let mut live = desired.clone();
        if let Some(spec) = live.spec.as_mut() {
            spec.type_ = Some("NodePort".to_string());
        }
        assert_eq!(
            plan_apply(&desired, Some(&live)).unwrap(),
            ApplyOutcome::Patched
        );
    }

    #[test]
    fn test_replica_only_change_is_a_scale() {
        // 4 and 5 nodes need the same master quorum, so only replicas differ
        let live = desired_statefulset(4);
        let desired = desired_statefulset(5);

        assert_eq!(
            plan_statefulset(&desired, Some(&live)).unwrap(),
            GroupChange::Scale { from: 4, to: 5 }
        );
        assert_eq!(
            plan_statefulset(&live, Some(&live)).unwrap(),
            GroupChange::Unchanged
        );
        assert_eq!(plan_statefulset(&live, None).unwrap(), GroupChange::Create);
    }

    #[test]
    fn test_template_change_is_a_patch() {
        let live = desired_statefulset(3);
        let db = ElasticsearchBuilder::flat("es1", "default")
            .with_replicas(3)
            .with_storage("1Gi", Some("standard"))
            .with_uid("test-uid-12345")
            .with_version("7.10")
            .build();
        let (role, node) = db.spec.shape.node_groups()[0];
        let desired = statefulset::generate_statefulset(&db, role, node, &OperatorConfig::default());

        assert_eq!(
            plan_statefulset(&desired, Some(&live)).unwrap(),
            GroupChange::Patch
        );
    }

    #[test]
    fn test_canonicalized_quantities_are_unchanged() {
        let db = ElasticsearchBuilder::flat("es1", "default")
            .with_replicas(3)
            .with_storage("1.5Gi", Some("standard"))
            .with_memory("1.5Gi")
            .with_uid("test-uid-12345")
            .build();
        let (role, node) = db.spec.shape.node_groups()[0];
        let desired = statefulset::generate_statefulset(&db, role, node, &OperatorConfig::default());

        // The API server reads quantities back in canonical form
        let stored = serde_json::to_string(&desired)
            .unwrap()
            .replace("\"1.5Gi\"", "\"1536Mi\"");
        assert!(stored.contains("1536Mi"));
        let live: StatefulSet = serde_json::from_str(&stored).unwrap();

        assert_eq!(
            plan_statefulset(&desired, Some(&live)).unwrap(),
            GroupChange::Unchanged
        );
    }

    #[test]
    fn test_changed_quantity_is_a_patch() {
        let live = desired_statefulset(3);
        let db = ElasticsearchBuilder::flat("es1", "default")
            .with_replicas(3)
            .with_storage("1Gi", Some("standard"))
            .with_memory("2Gi")
            .with_uid("test-uid-12345")
            .build();
        let (role, node) = db.spec.shape.node_groups()[0];
        let desired = statefulset::generate_statefulset(&db, role, node, &OperatorConfig::default());

        assert_eq!(
            plan_statefulset(&desired, Some(&live)).unwrap(),
            GroupChange::Patch
        );
    }

    #[test]
    fn test_apply_outcome_changed() {
        assert!(ApplyOutcome::Created.changed());
        assert!(ApplyOutcome::Patched.changed());
        assert!(!ApplyOutcome::Unchanged.changed());
    }
}

mod ownership_tests {
    use super::*;

    #[test]
    fn test_owned_and_orphan_objects_accepted() {
        let db = create_test_database("es1", "default", 1);
        let owned = ObjectMeta {
            name: Some("es1".to_string()),
            owner_references: Some(vec![owner_reference(&db)]),
            ..Default::default()
        };
        assert!(check_ownership(&owned, "test-uid-12345", "StatefulSet").is_ok());

        let orphan = ObjectMeta {
            name: Some("es1".to_string()),
            ..Default::default()
        };
        assert!(check_ownership(&orphan, "test-uid-12345", "StatefulSet").is_ok());
    }

    #[test]
    fn test_foreign_controller_is_a_conflict() {
        let other = ElasticsearchBuilder::flat("es1", "default")
            .with_uid("someone-else")
            .build();
        let meta = ObjectMeta {
            name: Some("es1".to_string()),
            owner_references: Some(vec![owner_reference(&other)]),
            ..Default::default()
        };

        match check_ownership(&meta, "test-uid-12345", "StatefulSet") {
            Err(Error::ConflictError(message)) => assert!(message.contains("StatefulSet")),
            other => panic!("expected conflict, got {:?}", other),
        }
    }
}

mod readiness_tests {
    use super::*;

    #[test]
    fn test_every_group_ready() {
        assert_eq!(tally_ready(&[(3, 3), (2, 2), (1, 1)]), (6, 6));
    }

    #[test]
    fn test_surplus_in_one_group_does_not_cover_another() {
        // Old masters still terminating while no data pod is up
        let (ready, desired) = tally_ready(&[(3, 1), (0, 2)]);
        assert_eq!((ready, desired), (1, 3));
        assert!(ready < desired);
    }

    #[test]
    fn test_no_groups() {
        assert_eq!(tally_ready(&[]), (0, 0));
    }
}

mod resume_tests {
    use super::*;

    /// A StatefulSet as a Pause deletion leaves it: running, orphaned
    fn paused_statefulset(desired: &StatefulSet) -> StatefulSet {
        let mut live = desired.clone();
        live.metadata.owner_references = None;
        live.metadata.uid = Some("sts-uid".to_string());
        live.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        live
    }

    #[test]
    fn test_resume_adopts_statefulset_in_place() {
        let desired = desired_statefulset(3);
        let live = paused_statefulset(&desired);

        assert!(check_ownership(&live.metadata, "test-uid-12345", "StatefulSet").is_ok());
        // Adoption writes the owner reference; the object is never recreated
        assert_eq!(
            plan_statefulset(&desired, Some(&live)).unwrap(),
            GroupChange::Patch
        );
    }

    #[test]
    fn test_adopted_statefulset_is_then_steady() {
        let desired = desired_statefulset(3);
        let mut live = paused_statefulset(&desired);
        live.metadata.owner_references = desired.metadata.owner_references.clone();

        assert_eq!(
            plan_statefulset(&desired, Some(&live)).unwrap(),
            GroupChange::Unchanged
        );
    }
}
