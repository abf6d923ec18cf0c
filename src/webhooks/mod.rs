//! Admission webhooks for Elasticsearch and Snapshot resources
//!
//! `/mutate` applies defaults as a JSONPatch, `/validate` runs the admission
//! guard for Elasticsearch CREATE, UPDATE and DELETE, and
//! `/validate-snapshot` checks new Snapshots before they are stored.

mod server;

pub use server::{
    AdmissionRequest, AdmissionResponse, AdmissionReview, AdmissionReviewResponse,
    AdmissionStatus, WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT, WebhookError,
    WebhookState, create_response, create_webhook_router, mutate_review, run_webhook_server,
    validate_review, validate_snapshot_review,
};
