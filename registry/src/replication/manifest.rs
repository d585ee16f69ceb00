//! Manifest replicator: recursively pulls a manifest (and its
//! platform-filtered children and blobs) from a peer or external upstream,
//! with an inbound-manifest cache and rate-limit delegation to a peer.

use crate::db::{self, Account, Db, Repository};
use crate::error::AppError;
use crate::ingestion::{self, Reference};
use crate::metrics;
use crate::refgraph::{self, Platform};
use crate::replication::blob::replicate_blob;
use crate::replication::ReplicationSource;
use crate::storage::StorageDriver;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use parking_lot::RwLock;
use reqwest::StatusCode;
use std::collections::HashMap;

/// Keyed by `(upstream_host, repo_name, reference)`; holds raw manifest
/// bytes so a second pull of the same (list or child) manifest within a
/// single sync doesn't hit the upstream twice.
#[derive(Default)]
pub struct ManifestCache {
    entries: RwLock<HashMap<(String, String, String), Bytes>>,
}

impl ManifestCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, host: &str, repo_name: &str, reference: &str) -> Option<Bytes> {
        let key = (host.to_string(), repo_name.to_string(), reference.to_string());
        let hit = self.entries.read().get(&key).cloned();
        metrics::record_manifest_cache(host, hit.is_some());
        hit
    }

    fn put(&self, host: &str, repo_name: &str, reference: &str, content: Bytes) {
        let key = (host.to_string(), repo_name.to_string(), reference.to_string());
        self.entries.write().insert(key, content);
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn replicate_manifest(
    db: &Db,
    storage: &dyn StorageDriver,
    http_client: &reqwest::Client,
    cache: &ManifestCache,
    account: &Account,
    repo: &Repository,
    reference: &str,
    source: &ReplicationSource,
    platform_filter: &[Platform],
    delegation_peers: &[ReplicationSource],
) -> Result<ingestion::IngestOutcome, AppError> {
    let upstream_host = host_of(&source.base_url);

    let content = match cache.get(&upstream_host, &repo.name, reference) {
        Some(bytes) => bytes,
        None => {
            let bytes = fetch_manifest(http_client, source, &repo.name, reference, delegation_peers).await?;
            cache.put(&upstream_host, &repo.name, reference, bytes.clone());
            bytes
        }
    };

    let parsed = refgraph::parse_manifest(&content).map_err(AppError::ManifestInvalid)?;

    if parsed.is_list {
        for manifest_ref in &parsed.manifest_refs {
            let matches = manifest_ref.platform.as_ref().map(|p| p.matches_filter(platform_filter)).unwrap_or(true);
            if !matches {
                continue;
            }
            if db::find_manifest(db, repo.id, &manifest_ref.digest).await?.is_some() {
                continue;
            }
            Box::pin(replicate_manifest(
                db,
                storage,
                http_client,
                cache,
                account,
                repo,
                &manifest_ref.digest,
                source,
                platform_filter,
                delegation_peers,
            ))
            .await?;
        }
    } else {
        // blob_refs[0] is always the image-config blob (see
        // refgraph::parse_manifest); replicate it eagerly since label
        // validation needs its content. Ordinary layers get a placeholder
        // and mount, replicated lazily on first GET.
        for (i, blob_ref) in parsed.blob_refs.iter().enumerate() {
            if i == 0 {
                replicate_blob(db, storage, http_client, account, &repo.name, &blob_ref.digest, source).await?;
                continue;
            }
            let mut tx = db::begin(db).await?;
            let blob = db::upsert_blob_placeholder(
                &mut tx,
                &account.name,
                &blob_ref.digest,
                blob_ref.size,
                Some(&blob_ref.media_type),
            )
            .await?;
            tx.commit().await?;
            db::mount_blob(db, blob.id, repo.id).await?;
        }
    }

    let push_reference = if reference.starts_with("sha256:") {
        Reference::Digest(reference)
    } else {
        Reference::Tag(reference)
    };

    ingestion::validate_and_store_manifest(db, storage, account, repo, push_reference, content.to_vec(), None).await
}

async fn fetch_manifest(
    http_client: &reqwest::Client,
    source: &ReplicationSource,
    repo_name: &str,
    reference: &str,
    delegation_peers: &[ReplicationSource],
) -> Result<Bytes, AppError> {
    let accept = [
        "application/vnd.oci.image.index.v1+json",
        "application/vnd.oci.image.manifest.v1+json",
        "application/vnd.docker.distribution.manifest.list.v2+json",
        "application/vnd.docker.distribution.manifest.v2+json",
    ]
    .join(", ");

    match fetch_from(http_client, source, repo_name, reference, &accept).await {
        Ok(bytes) => Ok(bytes),
        Err(AppError::TooManyRequests { .. }) if !source.is_peer => {
            for peer in delegation_peers {
                if let Ok(bytes) = fetch_via_delegation(http_client, peer, &host_of(&source.base_url), repo_name, reference).await {
                    return Ok(bytes);
                }
            }
            Err(AppError::TooManyRequests { retry_after_seconds: 60 })
        }
        Err(e) => Err(e),
    }
}

async fn fetch_from(
    http_client: &reqwest::Client,
    source: &ReplicationSource,
    repo_name: &str,
    reference: &str,
    accept: &str,
) -> Result<Bytes, AppError> {
    let url = format!("{}/v2/{}/manifests/{}", source.base_url, repo_name, reference);
    let mut request = http_client.get(&url).header("Accept", accept);
    if let (Some(user), Some(pass)) = (&source.username, &source.password) {
        let basic = STANDARD.encode(format!("{user}:{pass}"));
        request = request.header("Authorization", format!("Basic {basic}"));
    }
    let response = request.send().await?;

    if response.status() == StatusCode::TOO_MANY_REQUESTS {
        return Err(AppError::TooManyRequests { retry_after_seconds: 60 });
    }
    if response.status() == StatusCode::NOT_FOUND {
        return Err(AppError::UpstreamManifestMissing(format!("{repo_name}:{reference}")));
    }
    if !response.status().is_success() {
        return Err(AppError::Internal(format!("upstream returned {} fetching manifest {reference}", response.status())));
    }
    Ok(response.bytes().await?)
}

/// Asks a peer to pull the manifest on our behalf via its delegated-pull
/// API, swallowing any failure so the caller falls back to the original
/// rate-limit error.
async fn fetch_via_delegation(
    http_client: &reqwest::Client,
    peer: &ReplicationSource,
    upstream_host: &str,
    repo_name: &str,
    reference: &str,
) -> Result<Bytes, AppError> {
    let url = format!("{}/peer/v1/delegatedpull/{}/v2/{}/manifests/{}", peer.base_url, upstream_host, repo_name, reference);
    let mut request = http_client.get(&url);
    if let (Some(user), Some(pass)) = (&peer.username, &peer.password) {
        let basic = STANDARD.encode(format!("{user}:{pass}"));
        request = request.header("Authorization", format!("Basic {basic}"));
    }
    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(AppError::Internal(format!("delegation peer returned {}", response.status())));
    }
    Ok(response.bytes().await?)
}

fn host_of(base_url: &str) -> String {
    base_url.trim_start_matches("https://").trim_start_matches("http://").split('/').next().unwrap_or(base_url).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_cache_records_miss_then_hit() {
        let cache = ManifestCache::new();
        assert!(cache.get("peer.example.org", "test1/foo", "latest").is_none());
        cache.put("peer.example.org", "test1/foo", "latest", Bytes::from_static(b"{}"));
        assert!(cache.get("peer.example.org", "test1/foo", "latest").is_some());
    }

    #[test]
    fn host_of_strips_scheme_and_path() {
        assert_eq!(host_of("https://peer.example.org"), "peer.example.org");
        assert_eq!(host_of("http://peer.example.org/extra"), "peer.example.org");
    }
}
