//! HTTP surface: the OCI distribution API, the token/peering auth
//! endpoints, the inter-registry peer API, and the domain-remapping
//! middleware that sits in front of all three.

pub mod auth;
pub mod domain;
pub mod peer;
pub mod registry;

use axum::http::{header, HeaderMap};
use std::sync::Arc;

use crate::auth::pipeline::{self, Authorization, Challenge, IncomingRequest};
use crate::drivers::AuthDriver;
use crate::error::AppError;
use crate::AppState;

/// Extracts the host a request arrived at, preferring a trusted
/// `X-Forwarded-Host` (set by the domain-remap middleware or a fronting
/// proxy) over the `Host` header, and stripping a `:port` suffix.
pub(crate) fn host_from_headers(headers: &HeaderMap) -> Option<String> {
    let raw = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(header::HOST))
        .and_then(|v| v.to_str().ok())?;
    Some(raw.split(':').next().unwrap_or(raw).to_string())
}

/// Runs the authorization pipeline and, on a credential or scope
/// failure, turns it into an `AppError::Challenge` carrying the
/// `WWW-Authenticate` header a client needs to retry with a token.
pub(crate) async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    incoming: IncomingRequest,
) -> Result<Authorization, AppError> {
    let request_host = host_from_headers(headers).unwrap_or_else(|| state.config.api_public_hostname.clone());
    let auth_header = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());

    match pipeline::authorize(
        &state.config,
        &state.db,
        &state.identity_registry,
        state.auth_driver.as_ref() as &dyn AuthDriver,
        &request_host,
        auth_header,
        &incoming,
    )
    .await
    {
        Ok((authorization, _challenge)) => Ok(authorization),
        Err(AppError::Unauthorized(message)) => Err(with_challenge(state, &request_host, &incoming, message)),
        Err(AppError::MalformedAuthHeader) => {
            Err(with_challenge(state, &request_host, &incoming, "malformed Authorization header".to_string()))
        }
        Err(other) => Err(other),
    }
}

fn with_challenge(state: &AppState, request_host: &str, incoming: &IncomingRequest, message: String) -> AppError {
    let audience = incoming
        .audience_for_token_issuance
        .clone()
        .unwrap_or_else(|| crate::audience::identify_audience(request_host, &state.config));
    let challenge = Challenge {
        auth_endpoint_url: format!("https://{}/keppel/v1/auth", state.config.api_public_hostname),
        audience_hostname: audience.hostname(&state.config),
        scopes: incoming.scopes.clone(),
    };
    AppError::Challenge { message, www_authenticate: challenge.header_value() }
}

/// Full router: OCI distribution surface, auth endpoints, and the peer
/// replication API, merged under one `AppState`.
pub fn app_routes() -> axum::Router<Arc<AppState>> {
    axum::Router::new()
        .merge(auth::routes())
        .merge(registry::routes())
        .merge(peer::routes())
}
