//! Application error handling with HTTP response conversion.
//!
//! `AppError` is the single error type every handler and collaborator
//! returns; it knows how to render itself as a registry-protocol error
//! body and the right status code.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::storage::StorageError;
use crate::validation::ValidationError;

/// Application-level errors with HTTP response conversion.
#[derive(Debug, Error)]
pub enum AppError {
    // Authentication: 401 + challenge header.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("malformed Authorization header")]
    MalformedAuthHeader,
    /// Same as `Unauthorized`, but carries a `WWW-Authenticate` challenge
    /// for a client that hasn't presented a token yet.
    #[error("unauthorized: {message}")]
    Challenge { message: String, www_authenticate: String },

    // Authorization: 403 (or 401 when `correctly_return_403` is unset and a
    // challenge is appropriate — callers choose via `unauthorized_or_denied`).
    #[error("denied: {0}")]
    Denied(String),
    #[error("unsupported: {0}")]
    Unsupported(String),

    // Validation: 400 with the registry error body.
    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),
    #[error("digest invalid: {0}")]
    DigestInvalid(String),
    #[error("manifest references unknown blob: {0}")]
    ManifestBlobUnknown(String),
    #[error("manifest references unknown manifest: {0}")]
    ManifestUnknownRef(String),
    #[error("name invalid: {0}")]
    NameInvalid(String),

    // Capacity: 409 / 429.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("too many requests")]
    TooManyRequests { retry_after_seconds: u64 },

    // Not found: 404.
    #[error("account or repository not found: {0}")]
    NameUnknown(String),
    #[error("manifest not found")]
    ManifestUnknown,
    /// A replicated manifest's upstream returned 404.
    #[error("upstream manifest missing: {0}")]
    UpstreamManifestMissing(String),

    // Conflict: 409.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("concurrent replication already in progress")]
    ConcurrentReplication,
    /// Account deletion refused because top-level manifests still exist.
    #[error("account still has {total_manifest_count} manifest(s)")]
    AccountHasManifests { total_manifest_count: i64, top_level_manifest_digests: Vec<String> },

    // Transient: 500.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Registry v2 error body: `{errors:[{code, message, detail}]}`.
#[derive(Serialize)]
struct RegistryErrorBody {
    errors: Vec<RegistryErrorEntry>,
}

#[derive(Serialize)]
struct RegistryErrorEntry {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

/// Plain `{error}` body used by the auth and peering endpoints.
#[derive(Serialize)]
struct PlainErrorBody {
    error: String,
}

fn registry_body(code: &'static str, message: String) -> Json<RegistryErrorBody> {
    Json(RegistryErrorBody { errors: vec![RegistryErrorEntry { code, message, detail: None }] })
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, registry_body("UNAUTHORIZED", msg)).into_response()
            }
            AppError::MalformedAuthHeader => (
                StatusCode::UNAUTHORIZED,
                registry_body("UNAUTHORIZED", "malformed Authorization header".to_string()),
            )
                .into_response(),
            AppError::Challenge { message, www_authenticate } => {
                let mut resp = (StatusCode::UNAUTHORIZED, registry_body("UNAUTHORIZED", message)).into_response();
                if let Ok(value) = header::HeaderValue::from_str(&www_authenticate) {
                    resp.headers_mut().insert(header::WWW_AUTHENTICATE, value);
                }
                resp
            }
            AppError::Denied(msg) => (StatusCode::FORBIDDEN, registry_body("DENIED", msg)).into_response(),
            AppError::Unsupported(msg) => {
                (StatusCode::BAD_REQUEST, registry_body("UNSUPPORTED", msg)).into_response()
            }
            AppError::ManifestInvalid(msg) => {
                (StatusCode::BAD_REQUEST, registry_body("MANIFEST_INVALID", msg)).into_response()
            }
            AppError::DigestInvalid(msg) => {
                (StatusCode::BAD_REQUEST, registry_body("DIGEST_INVALID", msg)).into_response()
            }
            AppError::ManifestBlobUnknown(msg) => {
                (StatusCode::BAD_REQUEST, registry_body("MANIFEST_BLOB_UNKNOWN", msg)).into_response()
            }
            AppError::ManifestUnknownRef(msg) => {
                (StatusCode::BAD_REQUEST, registry_body("MANIFEST_UNKNOWN", msg)).into_response()
            }
            AppError::NameInvalid(msg) => {
                (StatusCode::BAD_REQUEST, registry_body("NAME_INVALID", msg)).into_response()
            }
            AppError::QuotaExceeded(msg) => {
                (StatusCode::CONFLICT, registry_body("DENIED", msg)).into_response()
            }
            AppError::TooManyRequests { retry_after_seconds } => {
                let mut resp = (
                    StatusCode::TOO_MANY_REQUESTS,
                    registry_body("TOO_MANY_REQUESTS", "too many requests".to_string()),
                )
                    .into_response();
                resp.headers_mut().insert(
                    header::RETRY_AFTER,
                    header::HeaderValue::from_str(&retry_after_seconds.to_string()).unwrap(),
                );
                resp
            }
            AppError::NameUnknown(msg) => {
                (StatusCode::NOT_FOUND, registry_body("NAME_UNKNOWN", msg)).into_response()
            }
            AppError::ManifestUnknown => (
                StatusCode::NOT_FOUND,
                registry_body("MANIFEST_UNKNOWN", "manifest unknown".to_string()),
            )
                .into_response(),
            AppError::UpstreamManifestMissing(msg) => (
                StatusCode::NOT_FOUND,
                registry_body("MANIFEST_UNKNOWN", format!("upstream manifest missing: {msg}")),
            )
                .into_response(),
            AppError::Conflict(msg) => {
                (StatusCode::CONFLICT, Json(PlainErrorBody { error: msg })).into_response()
            }
            AppError::ConcurrentReplication => (
                StatusCode::CONFLICT,
                Json(PlainErrorBody { error: "concurrent replication in progress".to_string() }),
            )
                .into_response(),
            AppError::AccountHasManifests { total_manifest_count, top_level_manifest_digests } => (
                StatusCode::CONFLICT,
                Json(PlainErrorBody {
                    error: format!(
                        "account still has {total_manifest_count} manifest(s); top-level digests: {}",
                        top_level_manifest_digests.join(", ")
                    ),
                }),
            )
                .into_response(),
            AppError::Storage(e) => {
                tracing::error!(error = %e, "storage error");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(PlainErrorBody { error: "internal error".to_string() }))
                    .into_response()
            }
            AppError::Validation(e) => (StatusCode::BAD_REQUEST, Json(PlainErrorBody { error: e.to_string() })).into_response(),
            AppError::Database(e) => {
                tracing::error!(error = %e, "database error");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(PlainErrorBody { error: "internal error".to_string() }))
                    .into_response()
            }
            AppError::Upstream(e) => {
                tracing::error!(error = %e, "upstream request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(PlainErrorBody { error: "internal error".to_string() }))
                    .into_response()
            }
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(PlainErrorBody { error: "internal error".to_string() }))
                    .into_response()
            }
        }
    }
}

impl AppError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Anonymous identities always get a 401+challenge. Everyone else was
    /// historically also answered with 401 for a denied scope; with
    /// `correctly_return_403` set, those cases are reported as 403 instead.
    pub fn insufficient_scope(had_bearer_token: bool, is_anonymous: bool, correctly_return_403: bool, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if is_anonymous {
            return Self::Unauthorized(detail);
        }
        let message = if had_bearer_token {
            format!("token does not cover scope {detail}")
        } else {
            format!("no permission for {detail}")
        };
        if correctly_return_403 {
            Self::Denied(message)
        } else {
            Self::Unauthorized(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_converts_via_from() {
        let storage_err = StorageError::NotFound;
        let app_err: AppError = storage_err.into();
        assert!(matches!(app_err, AppError::Storage(StorageError::NotFound)));
    }

    #[test]
    fn validation_error_converts_via_from() {
        let val_err = ValidationError::EmptyInput;
        let app_err: AppError = val_err.into();
        assert!(matches!(app_err, AppError::Validation(ValidationError::EmptyInput)));
    }

    #[test]
    fn insufficient_scope_anonymous_is_unauthorized() {
        let err = AppError::insufficient_scope(false, true, true, "repository:test1/foo:push");
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[test]
    fn insufficient_scope_bearer_without_correctly_return_403_is_unauthorized() {
        let err = AppError::insufficient_scope(true, false, false, "repository:test1/foo:push");
        match err {
            AppError::Unauthorized(msg) => assert!(msg.starts_with("token does not cover scope")),
            _ => panic!("expected Unauthorized"),
        }
    }

    #[test]
    fn insufficient_scope_bearer_with_correctly_return_403_is_denied() {
        let err = AppError::insufficient_scope(true, false, true, "repository:test1/foo:push");
        match err {
            AppError::Denied(msg) => assert!(msg.starts_with("token does not cover scope")),
            _ => panic!("expected Denied"),
        }
    }

    #[test]
    fn insufficient_scope_basic_with_correctly_return_403_is_denied() {
        let err = AppError::insufficient_scope(false, false, true, "repository:test1/foo:push");
        match err {
            AppError::Denied(msg) => assert!(msg.starts_with("no permission for")),
            _ => panic!("expected Denied"),
        }
    }
}
