//! Manifest ingestion: validates a pushed or replicated manifest
//! against the reference graph and policy, then persists it.

use crate::db::{self, Account, Db, Repository};
use crate::error::AppError;
use crate::refgraph::{self, ParsedManifest};
use crate::storage::StorageDriver;
use sha2::{Digest as Sha2Digest, Sha256};

/// A push reference is either a tag name or a `sha256:...` digest.
pub enum Reference<'a> {
    Tag(&'a str),
    Digest(&'a str),
}

pub struct IngestOutcome {
    pub digest: String,
    pub was_new: bool,
}

/// `ValidateAndStoreManifest`: digest pre-flight, quota check (skipped on
/// idempotent re-push), transactional reference validation, required-label
/// enforcement, storage write before commit, tag upsert.
pub async fn validate_and_store_manifest(
    db: &Db,
    storage: &dyn StorageDriver,
    account: &Account,
    repo: &Repository,
    reference: Reference<'_>,
    content: Vec<u8>,
    media_type_header: Option<&str>,
) -> Result<IngestOutcome, AppError> {
    let computed_digest = format!("sha256:{:x}", Sha256::digest(&content));
    let digest = match reference {
        Reference::Digest(d) => {
            if d != computed_digest {
                return Err(AppError::DigestInvalid(format!("expected {d}, computed {computed_digest}")));
            }
            d.to_string()
        }
        Reference::Tag(_) => computed_digest.clone(),
    };

    let parsed = refgraph::parse_manifest(&content).map_err(AppError::ManifestInvalid)?;
    let media_type = media_type_header.map(|s| s.to_string()).unwrap_or(parsed.media_type.clone());

    let pre_existing = db::find_manifest(db, repo.id, &digest).await?;
    let is_new = pre_existing.is_none();

    if is_new {
        enforce_quota(db, account).await?;
    }

    let mut tx = db::begin(db).await?;

    let mut blob_ids = Vec::with_capacity(parsed.blob_refs.len());
    for blob_ref in &parsed.blob_refs {
        let blob = db::find_blob(db, &account.name, &blob_ref.digest)
            .await?
            .ok_or_else(|| AppError::ManifestBlobUnknown(blob_ref.digest.clone()))?;
        blob_ids.push(blob.id);
    }

    let mut child_digests = Vec::with_capacity(parsed.manifest_refs.len());
    let mut child_sizes = Vec::new();
    let mut child_labels = Vec::new();
    for manifest_ref in &parsed.manifest_refs {
        let child = db::find_manifest(db, repo.id, &manifest_ref.digest)
            .await?
            .ok_or_else(|| AppError::ManifestUnknownRef(manifest_ref.digest.clone()))?;
        child_sizes.push(child.size_bytes);
        child_labels.push(child.labels_json.clone());
        child_digests.push(manifest_ref.digest.clone());
    }

    let own_labels = if parsed.is_list {
        refgraph::intersect_child_labels(&child_labels)
    } else {
        read_config_labels(storage, &account.name, &blob_ids, &parsed, db).await?
    };

    enforce_required_labels(account, own_labels.as_ref())?;

    let size_bytes = refgraph::compute_total_size(parsed.self_size, &parsed.blob_refs, &child_sizes);

    db::upsert_manifest(&mut tx, repo.id, &digest, &media_type, size_bytes, own_labels.as_ref(), None, None).await?;

    db::insert_manifest_contents(&mut tx, repo.id, &digest, &content).await?;
    db::set_manifest_blob_refs(&mut tx, repo.id, &digest, &blob_ids).await?;
    db::set_manifest_manifest_refs(&mut tx, repo.id, &digest, &child_digests).await?;

    if let Reference::Tag(tag_name) = reference {
        db::upsert_tag(&mut tx, repo.id, tag_name, &digest).await?;
    }

    storage.write_manifest(&account.name, &repo.name, &digest, &content).await?;

    tx.commit().await?;

    Ok(IngestOutcome { digest, was_new: is_new })
}

async fn enforce_quota(db: &Db, account: &Account) -> Result<(), AppError> {
    let Some(quota) = db::find_quota(db, &account.auth_tenant_id).await? else {
        return Ok(());
    };
    if quota.manifest_count_limit <= 0 {
        return Ok(());
    }
    let live_count = db::count_manifests_for_tenant(db, &account.auth_tenant_id).await?;
    if live_count >= quota.manifest_count_limit {
        crate::metrics::record_ingestion_quota_denial(&account.auth_tenant_id);
        return Err(AppError::QuotaExceeded(format!(
            "manifest quota of {} exceeded for tenant {}",
            quota.manifest_count_limit, account.auth_tenant_id
        )));
    }
    Ok(())
}

/// Labels for a single-image manifest come from its image-config blob's
/// top-level `config.Labels` object.
async fn read_config_labels(
    storage: &dyn StorageDriver,
    account_name: &str,
    blob_ids: &[i64],
    parsed: &ParsedManifest,
    db: &Db,
) -> Result<Option<serde_json::Value>, AppError> {
    let Some(config_ref) = parsed.blob_refs.first() else { return Ok(None) };
    let Some(&blob_id) = blob_ids.first() else { return Ok(None) };
    let blob = db::find_blob(db, account_name, &config_ref.digest).await?;
    let Some(blob) = blob else { return Ok(None) };
    if blob.id != blob_id || blob.is_unbacked() {
        return Ok(None);
    }
    let raw = storage.read_blob(account_name, &blob.storage_id).await.map_err(AppError::from)?;
    let config: serde_json::Value = serde_json::from_slice(&raw).map_err(|e| AppError::ManifestInvalid(e.to_string()))?;
    Ok(config.get("config").and_then(|c| c.get("Labels")).cloned())
}

fn enforce_required_labels(account: &Account, labels: Option<&serde_json::Value>) -> Result<(), AppError> {
    let Some(policy) = &account.validation_policy_json else { return Ok(()) };
    let Some(required) = policy.get("required_labels").and_then(|v| v.as_array()) else { return Ok(()) };

    for key in required {
        let Some(key) = key.as_str() else { continue };
        let present = labels.and_then(|l| l.get(key)).is_some();
        if !present {
            return Err(AppError::ManifestInvalid(format!("missing required label {key}")));
        }
    }
    Ok(())
}

/// Deletes a manifest: refuses if any other manifest still references it
/// (list membership), then cascades tags/edges/contents and removes the
/// stored object after the transaction commits.
pub async fn delete_manifest(
    db: &Db,
    storage: &dyn StorageDriver,
    account: &Account,
    repo: &Repository,
    digest: &str,
) -> Result<(), AppError> {
    let parents = db::parents_of_manifest(db, repo.id, digest).await?;
    if !parents.is_empty() {
        return Err(AppError::Conflict(format!("manifest {digest} is still referenced by {} manifest(s)", parents.len())));
    }

    let mut tx = db::begin(db).await?;
    db::delete_manifest(&mut tx, repo.id, digest).await?;
    tx.commit().await?;

    storage.delete_manifest(&account.name, &repo.name, digest).await.map_err(AppError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_labels_rejects_missing_key() {
        let account = test_account(Some(serde_json::json!({"required_labels": ["org.example.version"]})));
        let labels = Some(serde_json::json!({"org.example.other": "x"}));
        let err = enforce_required_labels(&account, labels.as_ref()).unwrap_err();
        assert!(matches!(err, AppError::ManifestInvalid(_)));
    }

    #[test]
    fn required_labels_accepts_when_present() {
        let account = test_account(Some(serde_json::json!({"required_labels": ["org.example.version"]})));
        let labels = Some(serde_json::json!({"org.example.version": "1.0"}));
        assert!(enforce_required_labels(&account, labels.as_ref()).is_ok());
    }

    #[test]
    fn required_labels_is_noop_without_policy() {
        let account = test_account(None);
        assert!(enforce_required_labels(&account, None).is_ok());
    }

    fn test_account(validation_policy_json: Option<serde_json::Value>) -> Account {
        Account {
            name: "test1".into(),
            auth_tenant_id: "tenant1".into(),
            replication_policy_json: None,
            platform_filter_json: None,
            validation_policy_json,
            metadata_json: None,
            gc_policies_json: serde_json::json!([]),
            security_scan_policies_json: serde_json::json!([]),
            in_maintenance: false,
            external_upstream_url: None,
            external_upstream_username: None,
            external_upstream_password: None,
            created_at: chrono::Utc::now(),
        }
    }
}
