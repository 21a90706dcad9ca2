// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the controller.
///
/// Variants map onto the controller's error taxonomy: validation,
/// authorization, resource conflict, upstream transient/permanent, timeout,
/// and internal invariant violations. `thiserror` gives us clean `Display`
/// impls and `From` conversions from the Kubernetes client's own error type.
#[derive(Error, Debug, Clone)]
pub enum ControllerError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("unknown image: {0}")]
    ImageUnknown(String),

    #[error("upstream Kubernetes error (transient): {0}")]
    UpstreamTransient(String),

    #[error("upstream Kubernetes error (permanent): {0}")]
    UpstreamPermanent(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("image source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("image source authentication required: {0}")]
    AuthRequired(String),
}

impl ControllerError {
    /// Whether this error should be retried internally by a caller that owns
    /// a bounded retry budget (spawn/delete step timeouts, refresh ticks).
    pub fn is_retryable(&self) -> bool {
        matches!(self, ControllerError::UpstreamTransient(_))
    }

    pub fn teardown_timeout(what: &str) -> Self {
        ControllerError::Timeout(format!("timeout waiting for teardown of {what}"))
    }

    pub fn spawn_timeout(step: &str) -> Self {
        ControllerError::Timeout(format!("timeout in spawn step '{step}'"))
    }

    /// Classifies a non-2xx HTTP status from an `ImageSource` backend.
    pub fn from_status(status: reqwest::StatusCode, context: &str) -> Self {
        match status.as_u16() {
            401 => ControllerError::AuthRequired(format!("{context}: {status}")),
            404 => ControllerError::NotFound(format!("{context}: {status}")),
            429 | 500..=599 => ControllerError::UpstreamTransient(format!("{context}: {status}")),
            _ => ControllerError::SourceUnavailable(format!("{context}: {status}")),
        }
    }
}

/// Classifies a `kube::Error` into our error taxonomy.
///
/// 5xx responses, connection resets, and `410 Gone` on watches are
/// transient and retried within the operation's overall timeout by the
/// caller; other 4xx responses are permanent; `404` becomes `NotFound`.
impl From<kube::Error> for ControllerError {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(resp) => {
                if resp.code == 404 {
                    ControllerError::NotFound(resp.message.clone())
                } else if resp.code == 409 {
                    ControllerError::Conflict(resp.message.clone())
                } else if resp.code == 401 || resp.code == 403 {
                    ControllerError::Forbidden(resp.message.clone())
                } else if resp.code == 410 || resp.code >= 500 {
                    ControllerError::UpstreamTransient(resp.message.clone())
                } else {
                    ControllerError::UpstreamPermanent(resp.message.clone())
                }
            }
            // Everything below the HTTP-response layer (connection resets,
            // TLS handshake failures, request building/serialization) is
            // treated as transient: these are the errors a re-list-on-watch
            // or a bounded step retry is meant to absorb.
            _ => ControllerError::UpstreamTransient(e.to_string()),
        }
    }
}

impl From<std::io::Error> for ControllerError {
    fn from(e: std::io::Error) -> Self {
        ControllerError::Internal(e.to_string())
    }
}

impl From<reqwest::Error> for ControllerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ControllerError::Timeout(e.to_string())
        } else if e.is_connect() {
            ControllerError::SourceUnavailable(e.to_string())
        } else if let Some(status) = e.status() {
            if status.as_u16() == 401 {
                ControllerError::AuthRequired(e.to_string())
            } else if status.as_u16() == 404 {
                ControllerError::NotFound(e.to_string())
            } else {
                ControllerError::SourceUnavailable(e.to_string())
            }
        } else {
            ControllerError::SourceUnavailable(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ControllerError {
    fn from(e: serde_json::Error) -> Self {
        ControllerError::Internal(format!("serialization error: {e}"))
    }
}

/// Wraps an already-shared error so it can be cloned cheaply into multiple
/// progress events without re-stringifying it at every call site.
pub type SharedError = Arc<ControllerError>;
