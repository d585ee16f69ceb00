//! Reference-graph entities as SQL row types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    pub auth_tenant_id: String,
    /// `{"strategy": "...", "upstream_peer_hostname": "..."}` or null.
    pub replication_policy_json: Option<serde_json::Value>,
    /// list of `{os, architecture, variant}` triples, or null for no filter.
    pub platform_filter_json: Option<serde_json::Value>,
    /// `{"required_labels": [...], "tag_policies_json": [...]}` or null.
    pub validation_policy_json: Option<serde_json::Value>,
    pub metadata_json: Option<serde_json::Value>,
    pub gc_policies_json: serde_json::Value,
    pub security_scan_policies_json: serde_json::Value,
    pub in_maintenance: bool,
    pub external_upstream_url: Option<String>,
    pub external_upstream_username: Option<String>,
    pub external_upstream_password: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Peer {
    pub hostname: String,
    pub our_password: String,
    pub their_current_password_hash: Option<String>,
    pub their_previous_password_hash: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub account_name: String,
    pub name: String,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Blob {
    pub id: i64,
    pub account_name: String,
    pub digest: String,
    /// Empty string denotes a placeholder awaiting replication.
    pub storage_id: String,
    pub size_bytes: i64,
    pub media_type: Option<String>,
    pub pushed_at: DateTime<Utc>,
    pub validated_at: DateTime<Utc>,
}

impl Blob {
    pub fn is_unbacked(&self) -> bool {
        self.storage_id.is_empty()
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BlobMount {
    pub blob_id: i64,
    pub repo_id: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Manifest {
    pub repo_id: i64,
    pub digest: String,
    pub media_type: String,
    pub size_bytes: i64,
    pub pushed_at: DateTime<Utc>,
    pub validated_at: DateTime<Utc>,
    pub labels_json: Option<serde_json::Value>,
    pub min_layer_created_at: Option<DateTime<Utc>>,
    pub max_layer_created_at: Option<DateTime<Utc>>,
    pub validation_error_message: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ManifestContents {
    pub repo_id: i64,
    pub digest: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Tag {
    pub repo_id: i64,
    pub name: String,
    pub digest: String,
    pub pushed_at: DateTime<Utc>,
    pub last_pulled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ManifestManifestRef {
    pub repo_id: i64,
    pub parent_digest: String,
    pub child_digest: String,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ManifestBlobRef {
    pub repo_id: i64,
    pub digest: String,
    pub blob_id: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PendingBlob {
    pub account_name: String,
    pub digest: String,
    pub pending_since: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Quota {
    pub auth_tenant_id: String,
    pub manifest_count: i64,
    pub manifest_count_limit: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RBACPolicy {
    pub id: i64,
    pub account_name: String,
    pub repository_pattern: String,
    pub username_pattern: Option<String>,
    pub permissions_json: serde_json::Value,
}

/// Normalized form of an `RBACPolicy`'s permissions column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RbacPermissions {
    #[serde(default)]
    pub anonymous_pull: bool,
    #[serde(default)]
    pub anonymous_first_pull: bool,
    #[serde(default)]
    pub pull: bool,
    #[serde(default)]
    pub push: bool,
    #[serde(default)]
    pub delete: bool,
}

impl RbacPermissions {
    /// `anonymous_first_pull` is only legal for replica accounts.
    pub fn validate_and_normalize(&self, account_is_replica: bool) -> Result<Self, String> {
        if self.anonymous_first_pull && !account_is_replica {
            return Err("anonymous_first_pull is only legal for replica accounts".to_string());
        }
        Ok(self.clone())
    }
}
