use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use rand::Rng;

use crate::crd::Elasticsearch;
use crate::resources::common::{auth_secret_name, owner_reference, standard_labels};

/// Admin user written into generated auth secrets
pub const ADMIN_USERNAME: &str = "admin";

/// Generate a secure random password
fn generate_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

/// Generate the admin credentials Secret `<db>-auth`
///
/// Only created when auth is enabled without a user-supplied secret. The
/// password is random, so callers must create it once and never re-apply.
pub fn generate_auth_secret(db: &Elasticsearch) -> Secret {
    let db_name = db.name_any();

    let string_data = BTreeMap::from([
        ("ADMIN_USERNAME".to_string(), ADMIN_USERNAME.to_string()),
        ("ADMIN_PASSWORD".to_string(), generate_password(32)),
    ]);

    Secret {
        metadata: ObjectMeta {
            name: Some(auth_secret_name(&db_name)),
            namespace: db.namespace(),
            labels: Some(standard_labels(&db_name)),
            owner_references: Some(vec![owner_reference(db)]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(string_data),
        ..Default::default()
    }
}
