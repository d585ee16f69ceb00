//! OCI distribution surface: base ping, catalog, manifests, blobs, and
//! chunked blob uploads.
//!
//! Repository paths come in two fixed shapes — `{account}/{repo}` and
//! `{account}/{ns}/{repo}` — rather than one wildcard segment, since axum
//! only allows a single trailing wildcard and repository names here are
//! always followed by a static suffix (`/manifests/...`, `/blobs/...`).

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, patch, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::pipeline::{Authorization, IncomingRequest};
use crate::db::{self, models::Account, models::Repository};
use crate::error::AppError;
use crate::ingestion::{self, Reference};
use crate::refgraph::Platform;
use crate::replication::{self, manifest::replicate_manifest, ReplicationSource};
use crate::scope::{Scope, ScopeSet};
use crate::uploads::UploadSession;
use crate::AppState;
use sha2::{Digest as Sha2Digest, Sha256};

use super::authorize;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v2/", get(ping))
        .route("/v2/_catalog", get(catalog))
        .route("/v2/{account}/{repo}/tags/list", get(tags_list))
        .route("/v2/{account}/{ns}/{repo}/tags/list", get(tags_list_ns))
        .route(
            "/v2/{account}/{repo}/manifests/{reference}",
            get(manifest_get).head(manifest_get).put(manifest_put).delete(manifest_delete),
        )
        .route(
            "/v2/{account}/{ns}/{repo}/manifests/{reference}",
            get(manifest_get_ns).head(manifest_get_ns).put(manifest_put_ns).delete(manifest_delete_ns),
        )
        .route("/v2/{account}/{repo}/blobs/{digest}", get(blob_get).head(blob_get))
        .route("/v2/{account}/{ns}/{repo}/blobs/{digest}", get(blob_get_ns).head(blob_get_ns))
        .route("/v2/{account}/{repo}/blobs/uploads/", post(blob_upload_start))
        .route("/v2/{account}/{ns}/{repo}/blobs/uploads/", post(blob_upload_start_ns))
        .route(
            "/v2/{account}/{repo}/blobs/uploads/{uuid}",
            patch(blob_upload_patch).put(blob_upload_finalize),
        )
        .route(
            "/v2/{account}/{ns}/{repo}/blobs/uploads/{uuid}",
            patch(blob_upload_patch_ns).put(blob_upload_finalize_ns),
        )
}

async fn ping() -> Response {
    (StatusCode::OK, [(header::HeaderName::from_static("docker-distribution-api-version"), "registry/2.0")]).into_response()
}

#[derive(Deserialize)]
struct CatalogQuery {
    n: Option<i64>,
    last: Option<String>,
}

#[derive(Serialize)]
struct CatalogResponse {
    repositories: Vec<String>,
}

async fn catalog(State(state): State<Arc<AppState>>, headers: HeaderMap, Query(query): Query<CatalogQuery>) -> Response {
    match catalog_inner(&state, &headers, query).await {
        Ok(resp) => resp.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn catalog_inner(state: &AppState, headers: &HeaderMap, query: CatalogQuery) -> Result<Json<CatalogResponse>, AppError> {
    let mut scopes = ScopeSet::new();
    scopes.add(Scope::new("registry", "catalog", vec!["*".to_string()]));
    let incoming = IncomingRequest {
        scopes,
        anycast_acceptable: false,
        domain_remapping_acceptable: true,
        audience_for_token_issuance: None,
        partial_access_allowed: true,
        no_implicit_anonymous: false,
        is_safe_method: true,
    };
    let authorization = authorize(state, headers, incoming).await?;

    let account_names: Vec<String> = authorization
        .scopes
        .iter()
        .filter(|s| s.resource_type == "keppel_account" && s.actions.iter().any(|a| a == "view"))
        .map(|s| s.name.clone())
        .collect();

    let limit = query.n.unwrap_or(100).clamp(1, 1000);
    let repositories = db::list_repository_names(&state.db, &account_names, query.last.as_deref(), limit).await?;
    Ok(Json(CatalogResponse { repositories }))
}

fn repository_scope(full_name: &str, actions: Vec<&str>) -> IncomingRequest {
    let mut scopes = ScopeSet::new();
    scopes.add(Scope::new("repository", full_name, actions.into_iter().map(String::from).collect()));
    IncomingRequest {
        scopes,
        anycast_acceptable: true,
        domain_remapping_acceptable: true,
        audience_for_token_issuance: None,
        partial_access_allowed: false,
        no_implicit_anonymous: false,
        is_safe_method: true,
    }
}

async fn authorize_repository(
    state: &AppState,
    headers: &HeaderMap,
    full_name: &str,
    action: &str,
) -> Result<Authorization, AppError> {
    let mut incoming = repository_scope(full_name, vec![action]);
    incoming.is_safe_method = action == "pull";
    authorize(state, headers, incoming).await
}

async fn load_account_and_repo(state: &AppState, account_name: &str, full_name: &str) -> Result<(Account, Repository), AppError> {
    let account = db::find_account(&state.db, account_name)
        .await?
        .ok_or_else(|| AppError::NameUnknown(account_name.to_string()))?;
    let repo = db::find_repository(&state.db, account_name, full_name)
        .await?
        .ok_or_else(|| AppError::NameUnknown(full_name.to_string()))?;
    Ok((account, repo))
}

async fn replication_source_for_account(state: &AppState, account: &Account) -> Option<ReplicationSource> {
    let peer_hostname = account
        .replication_policy_json
        .as_ref()
        .and_then(|p| p.get("upstream_peer_hostname"))
        .and_then(|v| v.as_str())?
        .to_string();
    let peer_password = db::find_peer(&state.db, &peer_hostname).await.ok().flatten().map(|p| p.our_password);
    replication::replication_source_for(account, &state.config.api_public_hostname, peer_password.as_deref())
}

fn platform_filter_for(account: &Account) -> Vec<Platform> {
    account
        .platform_filter_json
        .as_ref()
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

// ---- tags ----

#[derive(Deserialize)]
struct TagsQuery {
    n: Option<usize>,
    last: Option<String>,
}

#[derive(Serialize)]
struct TagsListResponse {
    name: String,
    tags: Vec<String>,
}

async fn tags_list_inner(state: &AppState, headers: &HeaderMap, account_name: String, full_name: String, query: TagsQuery) -> Result<Json<TagsListResponse>, AppError> {
    authorize_repository(state, headers, &full_name, "pull").await?;
    let (_account, repo) = load_account_and_repo(state, &account_name, &full_name).await?;
    let mut tags = db::list_tags_for_repo(&state.db, repo.id).await?;
    if let Some(last) = &query.last {
        tags.retain(|t| t.as_str() > last.as_str());
    }
    if let Some(n) = query.n {
        tags.truncate(n);
    }
    Ok(Json(TagsListResponse { name: full_name, tags }))
}

async fn tags_list(State(state): State<Arc<AppState>>, headers: HeaderMap, Path((account, repo)): Path<(String, String)>, Query(query): Query<TagsQuery>) -> Response {
    let full_name = format!("{account}/{repo}");
    tags_list_inner(&state, &headers, account, full_name, query).await.into_response()
}

async fn tags_list_ns(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((account, ns, repo)): Path<(String, String, String)>,
    Query(query): Query<TagsQuery>,
) -> Response {
    let full_name = format!("{account}/{ns}/{repo}");
    tags_list_inner(&state, &headers, account, full_name, query).await.into_response()
}

// ---- manifests ----

async fn manifest_get_inner(state: &AppState, headers: &HeaderMap, account_name: String, full_name: String, reference: String) -> Result<Response, AppError> {
    authorize_repository(state, headers, &full_name, "pull").await?;
    let (account, repo) = match load_account_and_repo(state, &account_name, &full_name).await {
        Ok(pair) => pair,
        Err(AppError::NameUnknown(_)) => {
            let account = db::find_account(&state.db, &account_name).await?.ok_or_else(|| AppError::NameUnknown(account_name.clone()))?;
            let repo = db::find_or_create_repository(&state.db, &account_name, &full_name).await?;
            (account, repo)
        }
        Err(e) => return Err(e),
    };

    let content = match state.storage_driver.read_manifest(&account.name, &repo.name, &reference).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => {
            let Some(source) = replication_source_for_account(state, &account).await else {
                return Err(AppError::ManifestUnknown);
            };
            let outcome = replicate_manifest(
                &state.db,
                state.storage_driver.as_ref(),
                &state.http_client,
                &state.manifest_cache,
                &account,
                &repo,
                &reference,
                &source,
                &platform_filter_for(&account),
                &[],
            )
            .await?;
            state.storage_driver.read_manifest(&account.name, &repo.name, &outcome.digest).await.map_err(AppError::from)?.to_vec()
        }
    };

    let digest = if reference.starts_with("sha256:") {
        reference.clone()
    } else {
        db::find_tag(&state.db, repo.id, &reference).await?.map(|t| t.digest).unwrap_or(reference.clone())
    };
    let manifest = db::find_manifest(&state.db, repo.id, &digest).await?;
    let media_type = manifest.as_ref().map(|m| m.media_type.clone()).unwrap_or_else(|| "application/vnd.oci.image.manifest.v1+json".to_string());

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, media_type)
        .header(header::CONTENT_LENGTH, content.len())
        .header("docker-content-digest", digest)
        .body(Body::from(content))
        .expect("manifest response is well-formed"))
}

async fn manifest_get(State(state): State<Arc<AppState>>, headers: HeaderMap, Path((account, repo, reference)): Path<(String, String, String)>) -> Response {
    let full_name = format!("{account}/{repo}");
    manifest_get_inner(&state, &headers, account, full_name, reference).await.unwrap_or_else(IntoResponse::into_response)
}

async fn manifest_get_ns(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((account, ns, repo, reference)): Path<(String, String, String, String)>,
) -> Response {
    let full_name = format!("{account}/{ns}/{repo}");
    manifest_get_inner(&state, &headers, account, full_name, reference).await.unwrap_or_else(IntoResponse::into_response)
}

async fn manifest_put_inner(
    state: &AppState,
    headers: &HeaderMap,
    account_name: String,
    full_name: String,
    reference: String,
    content_type: Option<String>,
    body: Bytes,
) -> Result<Response, AppError> {
    authorize_repository(state, headers, &full_name, "push").await?;
    let account = db::find_account(&state.db, &account_name).await?.ok_or_else(|| AppError::NameUnknown(account_name.clone()))?;
    let repo = db::find_or_create_repository(&state.db, &account_name, &full_name).await?;

    let push_reference = if reference.starts_with("sha256:") { Reference::Digest(&reference) } else { Reference::Tag(&reference) };
    let outcome = ingestion::validate_and_store_manifest(
        &state.db,
        state.storage_driver.as_ref(),
        &account,
        &repo,
        push_reference,
        body.to_vec(),
        content_type.as_deref(),
    )
    .await?;

    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header("docker-content-digest", outcome.digest)
        .header(header::LOCATION, format!("/v2/{full_name}/manifests/{reference}"))
        .body(Body::empty())
        .expect("manifest-put response is well-formed"))
}

async fn manifest_put(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((account, repo, reference)): Path<(String, String, String)>,
    body: Bytes,
) -> Response {
    let full_name = format!("{account}/{repo}");
    let content_type = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(String::from);
    manifest_put_inner(&state, &headers, account, full_name, reference, content_type, body)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn manifest_put_ns(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((account, ns, repo, reference)): Path<(String, String, String, String)>,
    body: Bytes,
) -> Response {
    let full_name = format!("{account}/{ns}/{repo}");
    let content_type = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(String::from);
    manifest_put_inner(&state, &headers, account, full_name, reference, content_type, body)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn manifest_delete_inner(state: &AppState, headers: &HeaderMap, account_name: String, full_name: String, reference: String) -> Result<Response, AppError> {
    authorize_repository(state, headers, &full_name, "delete").await?;
    let (account, repo) = load_account_and_repo(state, &account_name, &full_name).await?;
    let digest = if reference.starts_with("sha256:") {
        reference.clone()
    } else {
        db::find_tag(&state.db, repo.id, &reference).await?.map(|t| t.digest).ok_or(AppError::ManifestUnknown)?
    };
    ingestion::delete_manifest(&state.db, state.storage_driver.as_ref(), &account, &repo, &digest).await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

async fn manifest_delete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((account, repo, reference)): Path<(String, String, String)>,
) -> Response {
    let full_name = format!("{account}/{repo}");
    manifest_delete_inner(&state, &headers, account, full_name, reference).await.unwrap_or_else(IntoResponse::into_response)
}

async fn manifest_delete_ns(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((account, ns, repo, reference)): Path<(String, String, String, String)>,
) -> Response {
    let full_name = format!("{account}/{ns}/{repo}");
    manifest_delete_inner(&state, &headers, account, full_name, reference).await.unwrap_or_else(IntoResponse::into_response)
}

// ---- blobs ----

async fn blob_get_inner(state: &AppState, headers: &HeaderMap, account_name: String, full_name: String, digest: String) -> Result<Response, AppError> {
    authorize_repository(state, headers, &full_name, "pull").await?;
    let (account, repo) = load_account_and_repo(state, &account_name, &full_name).await?;

    let blob = db::find_blob(&state.db, &account.name, &digest).await?;
    let content = match blob {
        Some(b) if !b.is_unbacked() => state.storage_driver.read_blob(&account.name, &b.storage_id).await.map_err(AppError::from)?,
        _ => {
            let source = replication_source_for_account(state, &account).await.ok_or(AppError::NameUnknown(digest.clone()))?;
            replication::blob::replicate_blob(&state.db, state.storage_driver.as_ref(), &state.http_client, &account, &repo.name, &digest, &source).await?;
            let b = db::find_blob(&state.db, &account.name, &digest).await?.ok_or(AppError::NameUnknown(digest.clone()))?;
            state.storage_driver.read_blob(&account.name, &b.storage_id).await.map_err(AppError::from)?
        }
    };

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, content.len())
        .header("docker-content-digest", digest)
        .body(Body::from(content))
        .expect("blob response is well-formed"))
}

async fn blob_get(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((account, repo, digest)): Path<(String, String, String)>,
) -> Response {
    let full_name = format!("{account}/{repo}");
    blob_get_inner(&state, &headers, account, full_name, digest).await.unwrap_or_else(IntoResponse::into_response)
}

async fn blob_get_ns(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((account, ns, repo, digest)): Path<(String, String, String, String)>,
) -> Response {
    let full_name = format!("{account}/{ns}/{repo}");
    blob_get_inner(&state, &headers, account, full_name, digest).await.unwrap_or_else(IntoResponse::into_response)
}

#[derive(Deserialize)]
struct UploadStartQuery {
    mount: Option<String>,
    from: Option<String>,
}

async fn blob_upload_start_inner(state: &AppState, headers: &HeaderMap, account_name: String, full_name: String, query: UploadStartQuery) -> Result<Response, AppError> {
    authorize_repository(state, headers, &full_name, "push").await?;
    let account = db::find_account(&state.db, &account_name).await?.ok_or_else(|| AppError::NameUnknown(account_name.clone()))?;
    let repo = db::find_or_create_repository(&state.db, &account_name, &full_name).await?;

    if let (Some(digest), Some(from_repo)) = (&query.mount, &query.from) {
        if let Some(blob) = db::find_blob(&state.db, &account.name, digest).await? {
            if !blob.is_unbacked() {
                if let Some(source_repo) = db::find_repository(&state.db, &account_name, from_repo).await? {
                    if db::is_blob_mounted(&state.db, blob.id, source_repo.id).await? {
                        db::mount_blob(&state.db, blob.id, repo.id).await?;
                        return Ok(Response::builder()
                            .status(StatusCode::CREATED)
                            .header("docker-content-digest", digest.clone())
                            .header(header::LOCATION, format!("/v2/{full_name}/blobs/{digest}"))
                            .body(Body::empty())
                            .expect("mount response is well-formed"));
                    }
                }
            }
        }
    }

    let storage_id = state.storage_driver.generate_storage_id();
    let uuid = uuid::Uuid::new_v4().to_string();
    state.upload_sessions.open(
        uuid.clone(),
        UploadSession { account_name: account.name.clone(), repo_name: repo.name.clone(), storage_id, num_chunks: 0, size_bytes: 0 },
    );

    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(header::LOCATION, format!("/v2/{full_name}/blobs/uploads/{uuid}"))
        .header("docker-upload-uuid", uuid)
        .body(Body::empty())
        .expect("upload-start response is well-formed"))
}

async fn blob_upload_start(State(state): State<Arc<AppState>>, headers: HeaderMap, Path((account, repo)): Path<(String, String)>, Query(query): Query<UploadStartQuery>) -> Response {
    let full_name = format!("{account}/{repo}");
    blob_upload_start_inner(&state, &headers, account, full_name, query).await.unwrap_or_else(IntoResponse::into_response)
}

async fn blob_upload_start_ns(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((account, ns, repo)): Path<(String, String, String)>,
    Query(query): Query<UploadStartQuery>,
) -> Response {
    let full_name = format!("{account}/{ns}/{repo}");
    blob_upload_start_inner(&state, &headers, account, full_name, query).await.unwrap_or_else(IntoResponse::into_response)
}

async fn blob_upload_patch_inner(state: &AppState, headers: &HeaderMap, full_name: String, uuid: String, body: Bytes) -> Result<Response, AppError> {
    authorize_repository(state, headers, &full_name, "push").await?;
    let mut session = state.upload_sessions.get(&uuid).ok_or_else(|| AppError::NameUnknown(uuid.clone()))?;

    session.num_chunks += 1;
    state
        .storage_driver
        .append_to_blob(&session.account_name, &session.storage_id, session.num_chunks as u64, &body)
        .await
        .map_err(AppError::from)?;
    session.size_bytes += body.len() as u64;
    state.upload_sessions.update(&uuid, session.clone());

    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(header::LOCATION, format!("/v2/{full_name}/blobs/uploads/{uuid}"))
        .header("docker-upload-uuid", uuid)
        .header(header::RANGE, format!("0-{}", session.size_bytes.saturating_sub(1)))
        .body(Body::empty())
        .expect("upload-patch response is well-formed"))
}

async fn blob_upload_patch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((account, repo, uuid)): Path<(String, String, String)>,
    body: Bytes,
) -> Response {
    let full_name = format!("{account}/{repo}");
    blob_upload_patch_inner(&state, &headers, full_name, uuid, body).await.unwrap_or_else(IntoResponse::into_response)
}

async fn blob_upload_patch_ns(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((account, ns, repo, uuid)): Path<(String, String, String, String)>,
    body: Bytes,
) -> Response {
    let full_name = format!("{account}/{ns}/{repo}");
    blob_upload_patch_inner(&state, &headers, full_name, uuid, body).await.unwrap_or_else(IntoResponse::into_response)
}

#[derive(Deserialize)]
struct UploadFinalizeQuery {
    digest: String,
}

async fn blob_upload_finalize_inner(
    state: &AppState,
    headers: &HeaderMap,
    full_name: String,
    uuid: String,
    digest: String,
    trailing: Bytes,
) -> Result<Response, AppError> {
    authorize_repository(state, headers, &full_name, "push").await?;
    let mut session = state.upload_sessions.remove(&uuid).ok_or_else(|| AppError::NameUnknown(uuid.clone()))?;

    if !trailing.is_empty() {
        session.num_chunks += 1;
        state
            .storage_driver
            .append_to_blob(&session.account_name, &session.storage_id, session.num_chunks as u64, &trailing)
            .await
            .map_err(AppError::from)?;
        session.size_bytes += trailing.len() as u64;
    }

    if session.num_chunks == 0 {
        state.storage_driver.append_to_blob(&session.account_name, &session.storage_id, 1, &[]).await.map_err(AppError::from)?;
        session.num_chunks = 1;
    }

    state
        .storage_driver
        .finalize_blob(&session.account_name, &session.storage_id, session.num_chunks as u64)
        .await
        .map_err(AppError::from)?;

    let content = state.storage_driver.read_blob(&session.account_name, &session.storage_id).await.map_err(AppError::from)?;
    let computed = format!("sha256:{:x}", Sha256::digest(&content));
    if computed != digest {
        state.storage_driver.abort_blob_upload(&session.account_name, &session.storage_id, session.num_chunks as u64).await.ok();
        return Err(AppError::DigestInvalid(format!("expected {digest}, computed {computed}")));
    }

    let mut tx = db::begin(&state.db).await?;
    let blob = db::upsert_blob(&mut tx, &session.account_name, &digest, &session.storage_id, session.size_bytes as i64, None).await?;
    tx.commit().await?;
    let repo = db::find_or_create_repository(&state.db, &session.account_name, &session.repo_name).await?;
    db::mount_blob(&state.db, blob.id, repo.id).await?;

    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header("docker-content-digest", digest.clone())
        .header(header::LOCATION, format!("/v2/{full_name}/blobs/{digest}"))
        .body(Body::empty())
        .expect("upload-finalize response is well-formed"))
}

async fn blob_upload_finalize(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((account, repo, uuid)): Path<(String, String, String)>,
    Query(query): Query<UploadFinalizeQuery>,
    body: Bytes,
) -> Response {
    let full_name = format!("{account}/{repo}");
    blob_upload_finalize_inner(&state, &headers, full_name, uuid, query.digest, body).await.unwrap_or_else(IntoResponse::into_response)
}

async fn blob_upload_finalize_ns(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((account, ns, repo, uuid)): Path<(String, String, String, String)>,
    Query(query): Query<UploadFinalizeQuery>,
    body: Bytes,
) -> Response {
    let full_name = format!("{account}/{ns}/{repo}");
    blob_upload_finalize_inner(&state, &headers, full_name, uuid, query.digest, body).await.unwrap_or_else(IntoResponse::into_response)
}
