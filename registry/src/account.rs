//! Account lifecycle: creation/update validation and policy
//! application, and maintenance-gated deletion with cascade.

use crate::db::{self, Account, Db};
use crate::drivers::{ClaimOutcome, FederationDriver};
use crate::error::AppError;
use crate::identity::UserIdentity;
use crate::storage::StorageDriver;
use crate::validation;

pub struct CreateOrUpdateRequest {
    pub name: String,
    pub auth_tenant_id: String,
    pub replication_policy_json: Option<serde_json::Value>,
    pub platform_filter_json: Option<serde_json::Value>,
    pub validation_policy_json: Option<serde_json::Value>,
    pub metadata_json: Option<serde_json::Value>,
    /// Required only when claiming a brand-new account name for an
    /// internal-peer replica.
    pub sublease_token: Option<String>,
}

/// `CreateOrUpdateAccount`: validates the name, enforces tenant
/// consistency on update, claims the account name via the federation
/// driver for new replica accounts, and applies policy changes
/// transactionally.
pub async fn create_or_update_account(
    db: &Db,
    storage: &dyn StorageDriver,
    federation_driver: &dyn FederationDriver,
    identity: &dyn UserIdentity,
    req: CreateOrUpdateRequest,
) -> Result<Account, AppError> {
    if !validation::is_valid_account_name(&req.name) {
        return Err(AppError::NameInvalid(req.name));
    }

    let existing = db::find_account(db, &req.name).await?;

    if let Some(existing) = &existing {
        if existing.auth_tenant_id != req.auth_tenant_id {
            return Err(AppError::Conflict(format!(
                "account {} already belongs to a different tenant",
                req.name
            )));
        }
        if !identity.can_change_account(&existing.auth_tenant_id) {
            return Err(AppError::Denied(format!("no permission to change account {}", req.name)));
        }
        if existing.platform_filter_json != req.platform_filter_json {
            return Err(AppError::Conflict("platform filter is immutable after creation".to_string()));
        }
    } else {
        if !identity.can_change_account(&req.auth_tenant_id) {
            return Err(AppError::Denied(format!("no permission to create accounts for tenant {}", req.auth_tenant_id)));
        }

        let is_replica = req
            .replication_policy_json
            .as_ref()
            .and_then(|p| p.get("upstream_peer_hostname"))
            .is_some();
        if is_replica {
            let token = req
                .sublease_token
                .as_deref()
                .ok_or_else(|| AppError::Denied("sublease token required to claim a replica account name".to_string()))?;
            match federation_driver.claim_account_name(&req.name, token).await.map_err(|e| AppError::internal(e.to_string()))? {
                ClaimOutcome::Succeeded => {}
                ClaimOutcome::Failed => return Err(AppError::Denied(format!("account name {} could not be claimed", req.name))),
            }
        }

        if !storage.can_setup_account(&req.name).await {
            return Err(AppError::Internal(format!("storage driver refused to set up account {}", req.name)));
        }
    }

    let mut tx = db::begin(db).await?;
    let account = sqlx::query_as::<_, Account>(
        "INSERT INTO accounts (name, auth_tenant_id, replication_policy_json, platform_filter_json,
                                validation_policy_json, metadata_json, gc_policies_json,
                                security_scan_policies_json, in_maintenance, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, '[]'::jsonb, '[]'::jsonb, false, now())
         ON CONFLICT (name) DO UPDATE SET
             replication_policy_json = EXCLUDED.replication_policy_json,
             validation_policy_json = EXCLUDED.validation_policy_json,
             metadata_json = EXCLUDED.metadata_json
         RETURNING *",
    )
    .bind(&req.name)
    .bind(&req.auth_tenant_id)
    .bind(&req.replication_policy_json)
    .bind(&req.platform_filter_json)
    .bind(&req.validation_policy_json)
    .bind(&req.metadata_json)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(account)
}

pub struct DeletionReport {
    pub top_level_manifest_digests: Vec<String>,
    pub total_manifest_count: i64,
}

/// `DeleteAccount`: requires the account be in maintenance, reports up to
/// 10 top-level manifests plus the total count, then cascades the
/// repository/manifest/tag rows, forfeits the account name, and cleans up
/// storage.
pub async fn delete_account(
    db: &Db,
    storage: &dyn StorageDriver,
    federation_driver: &dyn FederationDriver,
    identity: &dyn UserIdentity,
    account_name: &str,
) -> Result<DeletionReport, AppError> {
    let account = db::find_account(db, account_name)
        .await?
        .ok_or_else(|| AppError::NameUnknown(account_name.to_string()))?;

    if !identity.can_change_account(&account.auth_tenant_id) {
        return Err(AppError::Denied(format!("no permission to delete account {account_name}")));
    }
    if !account.in_maintenance {
        return Err(AppError::Conflict("account must be placed in maintenance before deletion".to_string()));
    }

    let (total_manifest_count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM manifests m JOIN repositories r ON r.id = m.repo_id WHERE r.account_name = $1",
    )
    .bind(account_name)
    .fetch_one(db)
    .await?;

    let top_level_manifest_digests: Vec<(String,)> = sqlx::query_as(
        "SELECT m.digest FROM manifests m
         JOIN repositories r ON r.id = m.repo_id
         WHERE r.account_name = $1
           AND NOT EXISTS (
               SELECT 1 FROM manifest_manifest_refs mmr
               WHERE mmr.repo_id = m.repo_id AND mmr.child_digest = m.digest
           )
         LIMIT 10",
    )
    .bind(account_name)
    .fetch_all(db)
    .await?;

    if total_manifest_count > 0 {
        return Err(AppError::AccountHasManifests {
            total_manifest_count,
            top_level_manifest_digests: top_level_manifest_digests.into_iter().map(|(d,)| d).collect(),
        });
    }

    // Immediate blob sweep: drop anything already unmounted so the cascade
    // below can delete the rest unconditionally. If mounted blobs remain
    // (should be impossible once all manifests are gone) refuse deletion
    // rather than leaving orphaned storage objects behind.
    sqlx::query(
        "DELETE FROM blobs WHERE account_name = $1
           AND id NOT IN (SELECT blob_id FROM blob_mounts)",
    )
    .bind(account_name)
    .execute(db)
    .await?;

    let (remaining_blob_count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM blobs WHERE account_name = $1").bind(account_name).fetch_one(db).await?;
    if remaining_blob_count > 0 {
        return Err(AppError::Conflict(format!(
            "account {account_name} still has {remaining_blob_count} mounted blob(s) after sweep"
        )));
    }

    let mut tx = db::begin(db).await?;
    sqlx::query("DELETE FROM tags WHERE repo_id IN (SELECT id FROM repositories WHERE account_name = $1)")
        .bind(account_name)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "DELETE FROM manifest_blob_refs WHERE repo_id IN (SELECT id FROM repositories WHERE account_name = $1)",
    )
    .bind(account_name)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "DELETE FROM manifest_manifest_refs WHERE repo_id IN (SELECT id FROM repositories WHERE account_name = $1)",
    )
    .bind(account_name)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM manifests WHERE repo_id IN (SELECT id FROM repositories WHERE account_name = $1)")
        .bind(account_name)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM repositories WHERE account_name = $1").bind(account_name).execute(&mut *tx).await?;
    sqlx::query("DELETE FROM accounts WHERE name = $1").bind(account_name).execute(&mut *tx).await?;
    tx.commit().await?;

    storage.cleanup_account(account_name).await.map_err(AppError::from)?;
    federation_driver.forfeit_account_name(account_name).await.map_err(|e| AppError::internal(e.to_string()))?;

    Ok(DeletionReport {
        top_level_manifest_digests: top_level_manifest_digests.into_iter().map(|(d,)| d).collect(),
        total_manifest_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_reserved_account_names() {
        assert!(!validation::is_valid_account_name("keppel-internal"));
    }
}
