//! Error types for the Elasticsearch controllers

use std::time::Duration;

use thiserror::Error;

/// Error variants are named with the `Error` suffix for clarity (e.g., `KubeError`, `ValidationError`).
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    /// Resource-API call failed; retried with backoff
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Admission rejected the object; never retried
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Pod readiness or job completion wait exceeded its bound
    #[error("Timed out waiting for {what} after {elapsed:?}")]
    ConvergenceTimeout { what: String, elapsed: Duration },

    /// A derived object is owned by someone else or was modified concurrently
    #[error("Conflict: {0}")]
    ConflictError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Object storage error: {0}")]
    StorageError(String),

    #[error("Invalid schedule: {0}")]
    ScheduleError(String),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            Error::ConflictError(_) => true,
            // Storage may come back (credentials rotated, endpoint recovered)
            Error::StorageError(_) => true,
            Error::NotFound(_) => true,
            Error::ValidationError(_) => false,
            Error::ConvergenceTimeout { .. } => false,
            Error::InvalidConfig(_) => false,
            Error::ScheduleError(_) => false,
            Error::SerializationError(_) => false,
            Error::MissingObjectKey(_) => false,
        }
    }

    /// True for a 404 from the API server or an explicit NotFound
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(api_err)) => api_err.code == 404,
            Error::NotFound(_) => true,
            _ => false,
        }
    }

    /// True for a 409 from the API server
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(api_err)) => api_err.code == 409,
            Error::ConflictError(_) => true,
            _ => false,
        }
    }

    /// Stable CamelCase reason written to `status.reason` and events
    pub fn reason(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "KubernetesError",
            Error::ValidationError(_) => "ValidationFailed",
            Error::ConvergenceTimeout { .. } => "ConvergenceTimeout",
            Error::ConflictError(_) => "Conflict",
            Error::SerializationError(_) => "SerializationError",
            Error::MissingObjectKey(_) => "MissingObjectKey",
            Error::InvalidConfig(_) => "InvalidConfig",
            Error::NotFound(_) => "NotFound",
            Error::StorageError(_) => "StorageError",
            Error::ScheduleError(_) => "InvalidSchedule",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt.min(32) as i32);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }

    /// Get the delay for an error, with different handling for retryable vs non-retryable
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            // Non-retryable errors wait for a spec change; requeue slowly
            self.max_delay
        }
    }
}
