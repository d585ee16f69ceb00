//! Inter-registry peer API: unauthenticated from the outside world, but
//! every endpoint requires a `repl` identity — a request that got this
//! far without presenting peer credentials is rejected by `authorize`.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;

use crate::auth::pipeline::IncomingRequest;
use crate::db;
use crate::error::AppError;
use crate::refgraph::Platform;
use crate::replication::manifest::replicate_manifest;
use crate::scope::{Scope, ScopeSet};
use crate::AppState;

use super::authorize;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/peer/v1/sync-replica/{account}/{repo}", post(sync_replica))
        .route("/peer/v1/delegatedpull/{host}/v2/{repo}/manifests/{reference}", get(delegated_pull))
}

async fn authorize_peer(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let mut scopes = ScopeSet::new();
    scopes.add(Scope::new("keppel_api", "peer", vec!["access".to_string()]));
    let incoming = IncomingRequest {
        scopes,
        anycast_acceptable: false,
        domain_remapping_acceptable: false,
        audience_for_token_issuance: None,
        partial_access_allowed: false,
        no_implicit_anonymous: true,
        is_safe_method: false,
    };
    let authorization = authorize(state, headers, incoming).await?;
    if !authorization.identity.is_peer() {
        return Err(AppError::Denied("peer API requires a peer identity".to_string()));
    }
    Ok(())
}

#[derive(Deserialize)]
struct SyncReplicaRequest {
    reference: String,
}

async fn sync_replica(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((account, repo)): Path<(String, String)>,
    axum::Json(req): axum::Json<SyncReplicaRequest>,
) -> Response {
    match sync_replica_inner(&state, &headers, account, repo, req.reference).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn sync_replica_inner(state: &AppState, headers: &HeaderMap, account_name: String, repo_name: String, reference: String) -> Result<(), AppError> {
    authorize_peer(state, headers).await?;

    let full_name = format!("{account_name}/{repo_name}");
    let account = db::find_account(&state.db, &account_name).await?.ok_or_else(|| AppError::NameUnknown(account_name.clone()))?;
    let repo = db::find_or_create_repository(&state.db, &account_name, &full_name).await?;

    let source = crate::replication::replication_source_for(&account, &state.config.api_public_hostname, peer_password(state, &account).await.as_deref())
        .ok_or_else(|| AppError::Unsupported(format!("account {account_name} has no configured upstream to resync from")))?;

    let platform_filter: Vec<Platform> = account
        .platform_filter_json
        .as_ref()
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();

    replicate_manifest(
        &state.db,
        state.storage_driver.as_ref(),
        &state.http_client,
        &state.manifest_cache,
        &account,
        &repo,
        &reference,
        &source,
        &platform_filter,
        &[],
    )
    .await?;
    Ok(())
}

async fn peer_password(state: &AppState, account: &crate::db::models::Account) -> Option<String> {
    let peer_hostname = account.replication_policy_json.as_ref()?.get("upstream_peer_hostname")?.as_str()?.to_string();
    db::find_peer(&state.db, &peer_hostname).await.ok().flatten().map(|p| p.our_password)
}

/// Fetches a manifest directly from `host` on behalf of a peer that is
/// rate-limited there, without touching our own database or storage.
async fn delegated_pull(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((host, repo, reference)): Path<(String, String, String)>,
) -> Response {
    match delegated_pull_inner(&state, &headers, host, repo, reference).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

async fn delegated_pull_inner(state: &AppState, headers: &HeaderMap, host: String, repo: String, reference: String) -> Result<Response, AppError> {
    authorize_peer(state, headers).await?;

    let accept = [
        "application/vnd.oci.image.index.v1+json",
        "application/vnd.oci.image.manifest.v1+json",
        "application/vnd.docker.distribution.manifest.list.v2+json",
        "application/vnd.docker.distribution.manifest.v2+json",
    ]
    .join(", ");

    let url = format!("https://{host}/v2/{repo}/manifests/{reference}");
    let response = state.http_client.get(&url).header("Accept", accept).send().await.map_err(AppError::from)?;
    let status = response.status();
    let content_type = response.headers().get("content-type").cloned();
    let body = response.bytes().await.map_err(AppError::from)?;

    let mut builder = Response::builder().status(status.as_u16());
    if let Some(ct) = content_type {
        builder = builder.header("content-type", ct);
    }
    Ok(builder.body(Body::from(body)).expect("delegated-pull response is well-formed"))
}
