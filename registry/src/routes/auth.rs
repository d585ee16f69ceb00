//! `GET /keppel/v1/auth` token issuance and `POST /keppel/v1/auth/peering`,
//! the two endpoints that don't live under `/v2/`.

use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use std::sync::Arc;

use crate::audience::identify_audience;
use crate::auth::pipeline::IncomingRequest;
use crate::error::AppError;
use crate::peering::{handle_peering_request, PeeringError, PeeringRequest};
use crate::scope::{Scope, ScopeSet};
use crate::token;
use crate::AppState;

use super::{authorize, host_from_headers};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/keppel/v1/auth", get(issue_token))
        .route("/keppel/v1/auth/peering", post(peering))
}

/// `scope` can repeat, which `serde_urlencoded`-based extractors can't
/// collect into a `Vec`, so the raw query string is parsed by hand.
struct AuthQuery {
    service: Option<String>,
    scope: Vec<String>,
    account: Option<String>,
}

fn parse_auth_query(raw: Option<&str>) -> AuthQuery {
    let mut query = AuthQuery { service: None, scope: Vec::new(), account: None };
    let Some(raw) = raw else { return query };
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = percent_decode_str(value).decode_utf8_lossy().replace('+', " ");
        match key {
            "service" => query.service = Some(value),
            "scope" => query.scope.push(value),
            "account" => query.account = Some(value),
            _ => {}
        }
    }
    query
}

#[derive(Serialize)]
struct TokenResponse {
    token: String,
    access_token: String,
    expires_in: i64,
    issued_at: String,
}

/// Requested scopes, plus the always-granted `keppel_api:info:access` scope
/// every client gets to probe what it was actually given.
fn requested_scopes(query: &AuthQuery) -> ScopeSet {
    let mut set = ScopeSet::from_scopes(query.scope.iter().filter_map(|s| Scope::parse(s)));
    set.add(Scope::new("keppel_api", "info", vec!["access".to_string()]));
    set
}

async fn issue_token(State(state): State<Arc<AppState>>, headers: HeaderMap, RawQuery(raw): RawQuery) -> Response {
    let query = parse_auth_query(raw.as_deref());
    match issue_token_inner(&state, &headers, query).await {
        Ok(resp) => resp.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn issue_token_inner(state: &AppState, headers: &HeaderMap, query: AuthQuery) -> Result<Json<TokenResponse>, AppError> {
    let request_host = host_from_headers(headers).unwrap_or_else(|| state.config.api_public_hostname.clone());
    let audience = match &query.service {
        Some(service) => {
            let resolved = identify_audience(service, &state.config);
            if &resolved.hostname(&state.config) != service {
                return Err(AppError::Unsupported(format!("unrecognized service {service}")));
            }
            resolved
        }
        None => identify_audience(&request_host, &state.config),
    };

    // `account` pins the domain-remapped audience when a client authenticates
    // against the bare hostname but wants a token scoped to one account.
    let audience = match query.account {
        Some(ref account_name) if audience.account_name.is_empty() => {
            crate::audience::Audience { anycast: audience.anycast, account_name: account_name.clone() }
        }
        _ => audience,
    };

    let scopes = requested_scopes(&query);
    let incoming = IncomingRequest {
        scopes,
        anycast_acceptable: true,
        domain_remapping_acceptable: true,
        audience_for_token_issuance: Some(audience.clone()),
        partial_access_allowed: true,
        no_implicit_anonymous: false,
        is_safe_method: true,
    };

    let authorization = authorize(state, headers, incoming).await?;

    let is_scanner_token = authorization.identity.tag() == "trivy";
    let raw_token = token::issue_token(
        &state.config,
        &state.config.api_public_hostname,
        authorization.identity.as_ref(),
        &authorization.audience,
        authorization.scopes,
        is_scanner_token,
    )
    .map_err(|e| AppError::Unauthorized(e.to_string()))?;

    let lifetime = if is_scanner_token {
        state.config.scanner_token_lifetime_seconds
    } else {
        state.config.token_lifetime_seconds
    };

    Ok(Json(TokenResponse {
        token: raw_token.clone(),
        access_token: raw_token,
        expires_in: lifetime,
        issued_at: chrono::Utc::now().to_rfc3339(),
    }))
}

async fn peering(State(state): State<Arc<AppState>>, Json(req): Json<PeeringRequest>) -> Response {
    match handle_peering_request(&state.db, &state.http_client, &state.config.api_public_hostname, req).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(PeeringError::WrongUsername) => AppError::Unauthorized("username must be replication@<our-public-hostname>".to_string()).into_response(),
        Err(PeeringError::UnknownPeer(peer)) => AppError::NameUnknown(peer).into_response(),
        Err(PeeringError::ValidationFailed(msg)) => AppError::Unauthorized(msg).into_response(),
        Err(PeeringError::Database(e)) => AppError::Database(e).into_response(),
    }
}
