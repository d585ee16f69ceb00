//! Blob replicator: pulls a missing blob from a peer or external
//! upstream, streaming it into storage in bounded chunks, guarded by the
//! `PendingBlob` row as a distributed mutex.

use crate::db::{self, Account, Db};
use crate::error::AppError;
use crate::metrics;
use crate::replication::ReplicationSource;
use crate::storage::StorageDriver;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use sha2::{Digest as Sha2Digest, Sha256};

/// Matches the teacher's chunk-size convention, scaled down to the spec's
/// boundary for streamed blob replication.
const CHUNK_SIZE_BYTES: usize = 500 * 1024 * 1024;

pub async fn replicate_blob(
    db: &Db,
    storage: &dyn StorageDriver,
    http_client: &reqwest::Client,
    account: &Account,
    repo_name: &str,
    digest: &str,
    source: &ReplicationSource,
) -> Result<(), AppError> {
    if !db::try_insert_pending_blob(db, &account.name, digest).await? {
        return Err(AppError::ConcurrentReplication);
    }

    let outcome = do_replicate(db, storage, http_client, account, repo_name, digest, source).await;

    // The pending row is released regardless of outcome: it exists only to
    // serialize concurrent attempts, not to record replication history.
    db::delete_pending_blob(db, &account.name, digest).await?;

    outcome
}

async fn do_replicate(
    db: &Db,
    storage: &dyn StorageDriver,
    http_client: &reqwest::Client,
    account: &Account,
    repo_name: &str,
    digest: &str,
    source: &ReplicationSource,
) -> Result<(), AppError> {
    if let Some(existing) = db::find_blob(db, &account.name, digest).await? {
        if !existing.is_unbacked() {
            return Ok(());
        }
    }

    let url = format!("{}/v2/{}/blobs/{}", source.base_url, repo_name, digest);
    let mut request = http_client.get(&url);
    if let (Some(user), Some(pass)) = (&source.username, &source.password) {
        let basic = STANDARD.encode(format!("{user}:{pass}"));
        request = request.header("Authorization", format!("Basic {basic}"));
    }
    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(AppError::Internal(format!("upstream returned {} fetching {digest}", response.status())));
    }

    let storage_id = storage.generate_storage_id();
    let mut stream = response.bytes_stream();
    let mut buffer = BytesMut::new();
    let mut chunk_number = 0u64;
    let mut hasher = Sha256::new();
    let mut total_bytes = 0u64;

    while let Some(next) = stream.next().await {
        let piece: Bytes = next.map_err(|e| AppError::Internal(format!("stream read failed: {e}")))?;
        hasher.update(&piece);
        total_bytes += piece.len() as u64;
        buffer.extend_from_slice(&piece);

        while buffer.len() >= CHUNK_SIZE_BYTES {
            let chunk = buffer.split_to(CHUNK_SIZE_BYTES);
            chunk_number += 1;
            if let Err(e) = storage.append_to_blob(&account.name, &storage_id, chunk_number, &chunk).await {
                storage.abort_blob_upload(&account.name, &storage_id, chunk_number).await.ok();
                metrics::record_blob_upload_aborted(&account.name);
                return Err(AppError::from(e));
            }
        }
    }

    if !buffer.is_empty() || chunk_number == 0 {
        chunk_number += 1;
        if let Err(e) = storage.append_to_blob(&account.name, &storage_id, chunk_number, &buffer).await {
            storage.abort_blob_upload(&account.name, &storage_id, chunk_number).await.ok();
            metrics::record_blob_upload_aborted(&account.name);
            return Err(AppError::from(e));
        }
    }

    let computed_digest = format!("sha256:{:x}", hasher.finalize());
    if computed_digest != digest {
        storage.abort_blob_upload(&account.name, &storage_id, chunk_number).await.ok();
        metrics::record_blob_upload_aborted(&account.name);
        return Err(AppError::DigestInvalid(format!("upstream blob hashes to {computed_digest}, expected {digest}")));
    }

    if let Err(e) = storage.finalize_blob(&account.name, &storage_id, chunk_number).await {
        storage.abort_blob_upload(&account.name, &storage_id, chunk_number).await.ok();
        metrics::record_blob_upload_aborted(&account.name);
        return Err(AppError::from(e));
    }

    let mut tx = db::begin(db).await?;
    let db_result = sqlx::query(
        "INSERT INTO blobs (account_name, digest, storage_id, size_bytes, pushed_at, validated_at)
         VALUES ($1, $2, $3, $4, now(), now())
         ON CONFLICT (account_name, digest) DO UPDATE SET storage_id = EXCLUDED.storage_id, size_bytes = EXCLUDED.size_bytes",
    )
    .bind(&account.name)
    .bind(digest)
    .bind(&storage_id)
    .bind(total_bytes as i64)
    .execute(&mut *tx)
    .await;

    match db_result {
        Ok(_) => {
            tx.commit().await?;
            metrics::record_blob_replication_bytes(&account.name, total_bytes);
            Ok(())
        }
        Err(e) => {
            // The storage object is now orphaned since the DB row never
            // landed; clean it up rather than leaking it.
            storage.delete_blob(&account.name, &storage_id).await.ok();
            Err(AppError::from(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_constant_matches_stated_boundary() {
        assert_eq!(CHUNK_SIZE_BYTES, 500 * 1024 * 1024);
    }
}
