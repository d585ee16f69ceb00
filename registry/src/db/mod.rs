//! SQL-backed reference graph: connection pool plus per-entity
//! query helpers shared by the ingestion processor, replicators, and
//! account lifecycle.

pub mod models;

use crate::config::Config;
use chrono::{DateTime, Utc};
pub use models::*;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

pub type Db = PgPool;
pub type Tx<'a> = Transaction<'a, Postgres>;

pub async fn connect(cfg: &Config) -> Result<Db, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .connect(&cfg.database.url)
        .await
}

/// Applies the schema migrations embedded at compile time from
/// `migrations/`, tracked via sqlx's own `_sqlx_migrations` table.
pub async fn run_migrations(db: &Db) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!().run(db).await
}

pub async fn find_account(db: &Db, name: &str) -> Result<Option<Account>, sqlx::Error> {
    sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE name = $1")
        .bind(name)
        .fetch_optional(db)
        .await
}

pub async fn find_repository(db: &Db, account_name: &str, name: &str) -> Result<Option<Repository>, sqlx::Error> {
    sqlx::query_as::<_, Repository>("SELECT * FROM repositories WHERE account_name = $1 AND name = $2")
        .bind(account_name)
        .bind(name)
        .fetch_optional(db)
        .await
}

pub async fn find_or_create_repository(db: &Db, account_name: &str, name: &str) -> Result<Repository, sqlx::Error> {
    if let Some(repo) = find_repository(db, account_name, name).await? {
        return Ok(repo);
    }
    sqlx::query_as::<_, Repository>(
        "INSERT INTO repositories (account_name, name) VALUES ($1, $2)
         ON CONFLICT (account_name, name) DO UPDATE SET name = EXCLUDED.name
         RETURNING *",
    )
    .bind(account_name)
    .bind(name)
    .fetch_one(db)
    .await
}

pub async fn find_blob(db: &Db, account_name: &str, digest: &str) -> Result<Option<Blob>, sqlx::Error> {
    sqlx::query_as::<_, Blob>("SELECT * FROM blobs WHERE account_name = $1 AND digest = $2")
        .bind(account_name)
        .bind(digest)
        .fetch_optional(db)
        .await
}

pub async fn is_blob_mounted(db: &Db, blob_id: i64, repo_id: i64) -> Result<bool, sqlx::Error> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT blob_id FROM blob_mounts WHERE blob_id = $1 AND repo_id = $2")
            .bind(blob_id)
            .bind(repo_id)
            .fetch_optional(db)
            .await?;
    Ok(row.is_some())
}

pub async fn mount_blob(db: &Db, blob_id: i64, repo_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO blob_mounts (blob_id, repo_id) VALUES ($1, $2)
         ON CONFLICT (blob_id, repo_id) DO NOTHING",
    )
    .bind(blob_id)
    .bind(repo_id)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn find_manifest(db: &Db, repo_id: i64, digest: &str) -> Result<Option<Manifest>, sqlx::Error> {
    sqlx::query_as::<_, Manifest>("SELECT * FROM manifests WHERE repo_id = $1 AND digest = $2")
        .bind(repo_id)
        .bind(digest)
        .fetch_optional(db)
        .await
}

pub async fn count_manifests_for_tenant(db: &Db, auth_tenant_id: &str) -> Result<i64, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM manifests m
         JOIN repositories r ON r.id = m.repo_id
         JOIN accounts a ON a.name = r.account_name
         WHERE a.auth_tenant_id = $1",
    )
    .bind(auth_tenant_id)
    .fetch_one(db)
    .await?;
    Ok(count)
}

pub async fn find_quota(db: &Db, auth_tenant_id: &str) -> Result<Option<Quota>, sqlx::Error> {
    sqlx::query_as::<_, Quota>("SELECT * FROM quotas WHERE auth_tenant_id = $1")
        .bind(auth_tenant_id)
        .fetch_optional(db)
        .await
}

pub async fn find_peer(db: &Db, hostname: &str) -> Result<Option<Peer>, sqlx::Error> {
    sqlx::query_as::<_, Peer>("SELECT * FROM peers WHERE hostname = $1")
        .bind(hostname)
        .fetch_optional(db)
        .await
}

pub async fn set_peer_our_password(db: &Db, hostname: &str, our_password: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE peers SET our_password = $2 WHERE hostname = $1")
        .bind(hostname)
        .bind(our_password)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn rotate_peer_password_hash(db: &Db, hostname: &str, new_hash: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE peers SET their_previous_password_hash = their_current_password_hash,
                           their_current_password_hash = $2
         WHERE hostname = $1",
    )
    .bind(hostname)
    .bind(new_hash)
    .execute(db)
    .await?;
    Ok(())
}

/// Inserts a `PendingBlob` row, returning `Ok(false)` on unique-violation
/// (i.e. a concurrent replication is already in flight) rather than
/// propagating the SQL error.
pub async fn try_insert_pending_blob(db: &Db, account_name: &str, digest: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO pending_blobs (account_name, digest, pending_since) VALUES ($1, $2, now())",
    )
    .bind(account_name)
    .bind(digest)
    .execute(db)
    .await;

    match result {
        Ok(_) => Ok(true),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Ok(false),
        Err(e) => Err(e),
    }
}

pub async fn delete_pending_blob(db: &Db, account_name: &str, digest: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM pending_blobs WHERE account_name = $1 AND digest = $2")
        .bind(account_name)
        .bind(digest)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn rbac_policies_for_account(db: &Db, account_name: &str) -> Result<Vec<RBACPolicy>, sqlx::Error> {
    sqlx::query_as::<_, RBACPolicy>("SELECT * FROM rbac_policies WHERE account_name = $1")
        .bind(account_name)
        .fetch_all(db)
        .await
}

/// `SELECT parent_digest FROM manifest_manifest_refs` for a given child —
/// the pre-check that a manifest has zero parents before allowing delete.
pub async fn parents_of_manifest(db: &Db, repo_id: i64, digest: &str) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT parent_digest FROM manifest_manifest_refs WHERE repo_id = $1 AND child_digest = $2",
    )
    .bind(repo_id)
    .bind(digest)
    .fetch_all(db)
    .await?;
    Ok(rows.into_iter().map(|(d,)| d).collect())
}

pub async fn begin(db: &Db) -> Result<Tx<'_>, sqlx::Error> {
    db.begin().await
}

pub async fn upsert_blob_placeholder(
    tx: &mut Tx<'_>,
    account_name: &str,
    digest: &str,
    size_bytes: i64,
    media_type: Option<&str>,
) -> Result<Blob, sqlx::Error> {
    sqlx::query_as::<_, Blob>(
        "INSERT INTO blobs (account_name, digest, storage_id, size_bytes, media_type, pushed_at, validated_at)
         VALUES ($1, $2, '', $3, $4, now(), now())
         ON CONFLICT (account_name, digest) DO UPDATE SET media_type = COALESCE(EXCLUDED.media_type, blobs.media_type)
         RETURNING *",
    )
    .bind(account_name)
    .bind(digest)
    .bind(size_bytes)
    .bind(media_type)
    .fetch_one(&mut **tx)
    .await
}

/// Replaces a blob placeholder with its real storage id once an upload
/// finalizes (or inserts it fresh for a first-time direct push).
pub async fn upsert_blob(
    tx: &mut Tx<'_>,
    account_name: &str,
    digest: &str,
    storage_id: &str,
    size_bytes: i64,
    media_type: Option<&str>,
) -> Result<Blob, sqlx::Error> {
    sqlx::query_as::<_, Blob>(
        "INSERT INTO blobs (account_name, digest, storage_id, size_bytes, media_type, pushed_at, validated_at)
         VALUES ($1, $2, $3, $4, $5, now(), now())
         ON CONFLICT (account_name, digest) DO UPDATE SET
             storage_id = EXCLUDED.storage_id,
             size_bytes = EXCLUDED.size_bytes,
             media_type = COALESCE(EXCLUDED.media_type, blobs.media_type)
         RETURNING *",
    )
    .bind(account_name)
    .bind(digest)
    .bind(storage_id)
    .bind(size_bytes)
    .bind(media_type)
    .fetch_one(&mut **tx)
    .await
}

pub async fn upsert_manifest(
    tx: &mut Tx<'_>,
    repo_id: i64,
    digest: &str,
    media_type: &str,
    size_bytes: i64,
    labels_json: Option<&serde_json::Value>,
    min_layer_created_at: Option<DateTime<Utc>>,
    max_layer_created_at: Option<DateTime<Utc>>,
) -> Result<Manifest, sqlx::Error> {
    sqlx::query_as::<_, Manifest>(
        "INSERT INTO manifests (repo_id, digest, media_type, size_bytes, pushed_at, validated_at,
                                 labels_json, min_layer_created_at, max_layer_created_at)
         VALUES ($1, $2, $3, $4, now(), now(), $5, $6, $7)
         ON CONFLICT (repo_id, digest) DO UPDATE SET
             media_type = EXCLUDED.media_type,
             size_bytes = EXCLUDED.size_bytes,
             validated_at = now(),
             labels_json = EXCLUDED.labels_json,
             min_layer_created_at = EXCLUDED.min_layer_created_at,
             max_layer_created_at = EXCLUDED.max_layer_created_at
         RETURNING *",
    )
    .bind(repo_id)
    .bind(digest)
    .bind(media_type)
    .bind(size_bytes)
    .bind(labels_json)
    .bind(min_layer_created_at)
    .bind(max_layer_created_at)
    .fetch_one(&mut **tx)
    .await
}

pub async fn insert_manifest_contents(tx: &mut Tx<'_>, repo_id: i64, digest: &str, content: &[u8]) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO manifest_contents (repo_id, digest, content) VALUES ($1, $2, $3)
         ON CONFLICT (repo_id, digest) DO UPDATE SET content = EXCLUDED.content",
    )
    .bind(repo_id)
    .bind(digest)
    .bind(content)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn blob_ref_digests(tx: &mut Tx<'_>, repo_id: i64, manifest_digest: &str) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT b.digest FROM manifest_blob_refs mbr
         JOIN blobs b ON b.id = mbr.blob_id
         WHERE mbr.repo_id = $1 AND mbr.digest = $2",
    )
    .bind(repo_id)
    .bind(manifest_digest)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows.into_iter().map(|(d,)| d).collect())
}

pub async fn set_manifest_blob_refs(tx: &mut Tx<'_>, repo_id: i64, manifest_digest: &str, blob_ids: &[i64]) -> Result<(), sqlx::Error> {
    let existing: Vec<(i64,)> =
        sqlx::query_as("SELECT blob_id FROM manifest_blob_refs WHERE repo_id = $1 AND digest = $2")
            .bind(repo_id)
            .bind(manifest_digest)
            .fetch_all(&mut **tx)
            .await?;
    let existing: Vec<i64> = existing.into_iter().map(|(id,)| id).collect();
    let (to_insert, to_delete) = crate::refgraph::diff_edges(&existing, blob_ids);

    for blob_id in to_insert {
        sqlx::query(
            "INSERT INTO manifest_blob_refs (repo_id, digest, blob_id) VALUES ($1, $2, $3)
             ON CONFLICT (repo_id, digest, blob_id) DO NOTHING",
        )
        .bind(repo_id)
        .bind(manifest_digest)
        .bind(blob_id)
        .execute(&mut **tx)
        .await?;
    }
    for blob_id in to_delete {
        sqlx::query("DELETE FROM manifest_blob_refs WHERE repo_id = $1 AND digest = $2 AND blob_id = $3")
            .bind(repo_id)
            .bind(manifest_digest)
            .bind(blob_id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

pub async fn set_manifest_manifest_refs(
    tx: &mut Tx<'_>,
    repo_id: i64,
    parent_digest: &str,
    child_digests: &[String],
) -> Result<(), sqlx::Error> {
    let existing: Vec<(String,)> = sqlx::query_as(
        "SELECT child_digest FROM manifest_manifest_refs WHERE repo_id = $1 AND parent_digest = $2",
    )
    .bind(repo_id)
    .bind(parent_digest)
    .fetch_all(&mut **tx)
    .await?;
    let existing: Vec<String> = existing.into_iter().map(|(d,)| d).collect();
    let (to_insert, to_delete) = crate::refgraph::diff_edges(&existing, child_digests);

    for child in to_insert {
        sqlx::query(
            "INSERT INTO manifest_manifest_refs (repo_id, parent_digest, child_digest) VALUES ($1, $2, $3)
             ON CONFLICT (repo_id, parent_digest, child_digest) DO NOTHING",
        )
        .bind(repo_id)
        .bind(parent_digest)
        .bind(&child)
        .execute(&mut **tx)
        .await?;
    }
    for child in to_delete {
        sqlx::query("DELETE FROM manifest_manifest_refs WHERE repo_id = $1 AND parent_digest = $2 AND child_digest = $3")
            .bind(repo_id)
            .bind(parent_digest)
            .bind(&child)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

pub async fn upsert_tag(tx: &mut Tx<'_>, repo_id: i64, name: &str, digest: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO tags (repo_id, name, digest, pushed_at, last_pulled_at) VALUES ($1, $2, $3, now(), NULL)
         ON CONFLICT (repo_id, name) DO UPDATE SET
             digest = EXCLUDED.digest,
             pushed_at = now()",
    )
    .bind(repo_id)
    .bind(name)
    .bind(digest)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn list_tags_for_repo(db: &Db, repo_id: i64) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_as::<_, (String,)>("SELECT name FROM tags WHERE repo_id = $1 ORDER BY name")
        .bind(repo_id)
        .fetch_all(db)
        .await
        .map(|rows| rows.into_iter().map(|(name,)| name).collect())
}

/// Repository names visible to the catalog listing, restricted to a set
/// of account names the caller is already permitted to view and paged by
/// the Docker registry `last`/`n` convention.
pub async fn list_repository_names(
    db: &Db,
    account_names: &[String],
    last: Option<&str>,
    limit: i64,
) -> Result<Vec<String>, sqlx::Error> {
    if account_names.is_empty() {
        return Ok(Vec::new());
    }
    sqlx::query_as::<_, (String,)>(
        "SELECT name FROM repositories
         WHERE account_name = ANY($1) AND ($2::text IS NULL OR name > $2)
         ORDER BY name LIMIT $3",
    )
    .bind(account_names)
    .bind(last)
    .bind(limit)
    .fetch_all(db)
    .await
    .map(|rows| rows.into_iter().map(|(name,)| name).collect())
}

pub async fn find_tag(db: &Db, repo_id: i64, name: &str) -> Result<Option<Tag>, sqlx::Error> {
    sqlx::query_as::<_, Tag>("SELECT * FROM tags WHERE repo_id = $1 AND name = $2")
        .bind(repo_id)
        .bind(name)
        .fetch_optional(db)
        .await
}

pub async fn delete_manifest(tx: &mut Tx<'_>, repo_id: i64, digest: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM tags WHERE repo_id = $1 AND digest = $2").bind(repo_id).bind(digest).execute(&mut **tx).await?;
    sqlx::query("DELETE FROM manifest_blob_refs WHERE repo_id = $1 AND digest = $2").bind(repo_id).bind(digest).execute(&mut **tx).await?;
    sqlx::query("DELETE FROM manifest_manifest_refs WHERE repo_id = $1 AND (parent_digest = $2 OR child_digest = $2)")
        .bind(repo_id)
        .bind(digest)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM manifest_contents WHERE repo_id = $1 AND digest = $2").bind(repo_id).bind(digest).execute(&mut **tx).await?;
    sqlx::query("DELETE FROM manifests WHERE repo_id = $1 AND digest = $2").bind(repo_id).bind(digest).execute(&mut **tx).await?;
    Ok(())
}

