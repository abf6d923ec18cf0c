//! PodDisruptionBudget generation for Elasticsearch node groups
//!
//! A node group gets a PDB only when it declares `maxUnavailable`.

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::{Elasticsearch, NodeRole, NodeSpec};
use crate::resources::common::{owner_reference, role_labels, statefulset_name};

/// Generate the PodDisruptionBudget of a node group, if it declares one
pub fn generate_pdb(
    db: &Elasticsearch,
    role: NodeRole,
    node: &NodeSpec,
) -> Option<PodDisruptionBudget> {
    let max_unavailable = node.max_unavailable?;
    let db_name = db.name_any();
    let labels = role_labels(&db_name, role);

    Some(PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(statefulset_name(&db_name, role, node)),
            namespace: db.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(db)]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            max_unavailable: Some(IntOrString::Int(max_unavailable)),
            selector: Some(LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}
