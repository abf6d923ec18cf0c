//! Service and ServiceAccount generation
//!
//! Each database gets one client Service named after it. The governing
//! headless Service and ServiceAccount are shared by every database in a
//! namespace and are named by the `--governing-service` flag, so they carry
//! no owner reference.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServiceAccount, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::{Elasticsearch, NodeRole};
use crate::resources::common::{
    FIELD_MANAGER, HTTP_PORT, ROLE_LABEL, TRANSPORT_PORT, owner_reference, standard_labels,
};

fn governing_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            "elasticsearch".to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
    ])
}

/// Generate the client Service of a database
///
/// Exposes `http` (9200) and `transport` (9300) and selects the pods that
/// serve client traffic: the flat group, or the client group of a topology.
pub fn generate_client_service(db: &Elasticsearch) -> Service {
    let name = db.name_any();
    let labels = standard_labels(&name);

    let client_role = if db.spec.shape.is_topology() {
        NodeRole::Client
    } else {
        NodeRole::Combined
    };
    let mut selector = standard_labels(&name);
    selector.insert(ROLE_LABEL.to_string(), client_role.as_str().to_string());

    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: db.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner_reference(db)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![
                ServicePort {
                    name: Some("http".to_string()),
                    port: HTTP_PORT,
                    target_port: Some(IntOrString::String("http".to_string())),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ServicePort {
                    name: Some("transport".to_string()),
                    port: TRANSPORT_PORT,
                    target_port: Some(IntOrString::String("transport".to_string())),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
            ]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the governing headless Service for a namespace
pub fn generate_governing_service(name: &str, namespace: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(governing_labels()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(governing_labels()),
            // Discovery needs peers before they pass readiness
            publish_not_ready_addresses: Some(true),
            ports: Some(vec![ServicePort {
                name: Some("transport".to_string()),
                port: TRANSPORT_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the ServiceAccount used by database pods
pub fn generate_service_account(name: &str, namespace: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(governing_labels()),
            ..Default::default()
        },
        ..Default::default()
    }
}
