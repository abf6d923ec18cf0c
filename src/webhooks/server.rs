//! Webhook HTTP server handlers
//!
//! Each handler unwraps the AdmissionReview and hands the request to a
//! plain async function, so the decisions can be tested without HTTP.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::post};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::admission::{AdmissionGuard, PlatformLookup, default_spec};
use crate::controller::error::Error;
use crate::crd::{Elasticsearch, Snapshot};

/// Kubernetes AdmissionReview request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    pub api_version: String,
    pub kind: String,
    pub request: Option<AdmissionRequest>,
}

/// AdmissionRequest contains the details of the admission request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    pub operation: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub object: Option<Value>,
    pub old_object: Option<Value>,
}

/// AdmissionReview response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewResponse {
    pub api_version: String,
    pub kind: String,
    pub response: AdmissionResponse,
}

/// AdmissionResponse contains the result
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AdmissionStatus>,
    /// Base64 encoded JSONPatch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionStatus {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Shared state for webhook handlers
pub struct WebhookState {
    pub lookup: Arc<dyn PlatformLookup>,
}

impl WebhookState {
    pub fn new(lookup: Arc<dyn PlatformLookup>) -> Self {
        Self { lookup }
    }
}

/// Create the webhook router
pub fn create_webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate", post(mutate_elasticsearch))
        .route("/validate", post(validate_elasticsearch))
        .route("/validate-snapshot", post(validate_snapshot))
        .with_state(state)
}

fn missing_request() -> (StatusCode, Json<AdmissionReviewResponse>) {
    error!("Admission review missing request");
    (
        StatusCode::BAD_REQUEST,
        Json(create_response(
            "",
            false,
            "Missing request in AdmissionReview",
            None,
        )),
    )
}

async fn mutate_elasticsearch(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview>,
) -> impl IntoResponse {
    match review.request {
        Some(request) => (
            StatusCode::OK,
            Json(mutate_review(state.lookup.as_ref(), request).await),
        ),
        None => missing_request(),
    }
}

async fn validate_elasticsearch(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview>,
) -> impl IntoResponse {
    match review.request {
        Some(request) => (
            StatusCode::OK,
            Json(validate_review(state.lookup.as_ref(), request).await),
        ),
        None => missing_request(),
    }
}

async fn validate_snapshot(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview>,
) -> impl IntoResponse {
    match review.request {
        Some(request) => (
            StatusCode::OK,
            Json(validate_snapshot_review(state.lookup.as_ref(), request).await),
        ),
        None => missing_request(),
    }
}

fn parse<T: serde::de::DeserializeOwned>(
    uid: &str,
    object: Option<Value>,
    kind: &str,
) -> Result<T, AdmissionReviewResponse> {
    let Some(object) = object else {
        return Err(create_response(uid, false, "Missing object in request", None));
    };
    serde_json::from_value(object).map_err(|e| {
        error!(error = %e, "Failed to parse {}", kind);
        create_response(uid, false, &format!("Failed to parse object: {}", e), None)
    })
}

fn deny(uid: &str, error: &Error) -> AdmissionReviewResponse {
    let message = match error {
        Error::ValidationError(message) => message.clone(),
        other => other.to_string(),
    };
    warn!(uid = %uid, reason = %error.reason(), message = %message, "Admission request denied");
    create_response(uid, false, &message, Some(error.reason()))
}

/// Default an Elasticsearch object and return the JSONPatch
pub async fn mutate_review(
    lookup: &dyn PlatformLookup,
    request: AdmissionRequest,
) -> AdmissionReviewResponse {
    let uid = request.uid.clone();
    info!(uid = %uid, operation = %request.operation, name = ?request.name, "Processing mutation request");

    if request.operation == "DELETE" {
        return create_response(&uid, true, "", None);
    }
    let Some(original) = request.object else {
        return create_response(&uid, false, "Missing object in request", None);
    };
    let mut db: Elasticsearch = match parse(&uid, Some(original.clone()), "Elasticsearch") {
        Ok(db) => db,
        Err(response) => return response,
    };

    let dormant = match (&request.namespace, &request.name) {
        (Some(ns), Some(name)) => lookup.dormant_database(ns, name).await.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to look up DormantDatabase, defaulting without it");
            None
        }),
        _ => None,
    };
    default_spec(&mut db.spec, dormant.as_ref());

    match defaults_patch(&original, &db) {
        Ok(Some(patch)) => {
            let mut response = create_response(&uid, true, "", None);
            response.response.patch = Some(patch);
            response.response.patch_type = Some("JSONPatch".to_string());
            response
        }
        Ok(None) => create_response(&uid, true, "", None),
        Err(e) => create_response(&uid, false, &format!("Failed to build patch: {}", e), None),
    }
}

/// JSONPatch turning `original` into the defaulted object, base64 encoded
fn defaults_patch(original: &Value, db: &Elasticsearch) -> serde_json::Result<Option<String>> {
    let mut defaulted = original.clone();
    defaulted["spec"] = serde_json::to_value(&db.spec)?;

    let patch = json_patch::diff(original, &defaulted);
    if patch.0.is_empty() {
        return Ok(None);
    }
    Ok(Some(STANDARD.encode(serde_json::to_vec(&patch)?)))
}

/// Run the admission guard for an Elasticsearch request
pub async fn validate_review(
    lookup: &dyn PlatformLookup,
    request: AdmissionRequest,
) -> AdmissionReviewResponse {
    let uid = request.uid.clone();
    info!(
        uid = %uid,
        operation = %request.operation,
        namespace = ?request.namespace,
        name = ?request.name,
        "Processing admission request"
    );
    let guard = AdmissionGuard::new(lookup);

    let result = match request.operation.as_str() {
        "CREATE" => match parse::<Elasticsearch>(&uid, request.object, "Elasticsearch") {
            Ok(db) => guard.validate(&db).await,
            Err(response) => return response,
        },
        "UPDATE" => {
            let db = match parse::<Elasticsearch>(&uid, request.object, "Elasticsearch") {
                Ok(db) => db,
                Err(response) => return response,
            };
            match request.old_object.map(serde_json::from_value::<Elasticsearch>) {
                Some(Ok(old)) => guard.validate_update(&old, &db).await,
                Some(Err(e)) => {
                    warn!(error = %e, "Failed to parse old Elasticsearch, treating as CREATE");
                    guard.validate(&db).await
                }
                None => guard.validate(&db).await,
            }
        }
        "DELETE" => match parse::<Elasticsearch>(&uid, request.old_object, "Elasticsearch") {
            Ok(live) => guard.validate_delete(&live),
            Err(_) => Ok(()),
        },
        _ => Ok(()),
    };

    match result {
        Ok(()) => {
            info!(uid = %uid, "Admission request allowed");
            create_response(&uid, true, "", None)
        }
        Err(e) => deny(&uid, &e),
    }
}

/// Validate a new Snapshot
///
/// Updates and deletes are always allowed; the controller owns status.
pub async fn validate_snapshot_review(
    lookup: &dyn PlatformLookup,
    request: AdmissionRequest,
) -> AdmissionReviewResponse {
    let uid = request.uid.clone();
    if request.operation != "CREATE" {
        return create_response(&uid, true, "", None);
    }

    let snapshot: Snapshot = match parse(&uid, request.object, "Snapshot") {
        Ok(snapshot) => snapshot,
        Err(response) => return response,
    };
    match AdmissionGuard::new(lookup).validate_snapshot(&snapshot).await {
        Ok(()) => {
            info!(uid = %uid, "Snapshot admission request allowed");
            create_response(&uid, true, "", None)
        }
        Err(e) => deny(&uid, &e),
    }
}

/// Create an AdmissionReview response
pub fn create_response(
    uid: &str,
    allowed: bool,
    message: &str,
    reason: Option<&str>,
) -> AdmissionReviewResponse {
    AdmissionReviewResponse {
        api_version: "admission.k8s.io/v1".to_string(),
        kind: "AdmissionReview".to_string(),
        response: AdmissionResponse {
            uid: uid.to_string(),
            allowed,
            status: if allowed {
                None
            } else {
                Some(AdmissionStatus {
                    code: 403,
                    message: message.to_string(),
                    reason: reason.map(String::from),
                })
            },
            patch: None,
            patch_type: None,
        },
    }
}

/// Default path to webhook TLS certificate
pub const WEBHOOK_CERT_PATH: &str = "/etc/webhook/certs/tls.crt";
/// Default path to webhook TLS private key
pub const WEBHOOK_KEY_PATH: &str = "/etc/webhook/certs/tls.key";
/// Default webhook server port
pub const WEBHOOK_PORT: u16 = 8443;

/// Run the webhook server with TLS
pub async fn run_webhook_server(
    state: Arc<WebhookState>,
    addr: SocketAddr,
    cert_path: &Path,
    key_path: &Path,
) -> Result<(), WebhookError> {
    use axum_server::tls_rustls::RustlsConfig;

    let app = create_webhook_router(state);

    let config = RustlsConfig::from_pem_file(cert_path, key_path)
        .await
        .map_err(|e| WebhookError::TlsConfig(e.to_string()))?;

    info!("Webhook server listening on {} with TLS", addr);

    axum_server::bind_rustls(addr, config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))?;

    Ok(())
}

/// Errors that can occur when running the webhook server
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("Webhook server error: {0}")]
    Server(String),
}
