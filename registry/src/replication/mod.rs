//! Replication workers: a blob replicator and a manifest replicator.

pub mod blob;
pub mod manifest;

use crate::db::models::Account;

/// Where to pull replicated content from: an internal peer (Basic auth as
/// `replication@<our-hostname>`) or an external upstream registry.
pub struct ReplicationSource {
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub is_peer: bool,
}

/// Resolves the account's configured upstream, from either the peer-backed
/// `replication_policy_json` or the external-upstream columns.
pub fn replication_source_for(account: &Account, our_public_hostname: &str, peer_our_password: Option<&str>) -> Option<ReplicationSource> {
    if let Some(policy) = &account.replication_policy_json {
        if let Some(peer_hostname) = policy.get("upstream_peer_hostname").and_then(|v| v.as_str()) {
            return Some(ReplicationSource {
                base_url: format!("https://{peer_hostname}"),
                username: Some(format!("replication@{our_public_hostname}")),
                password: peer_our_password.map(|s| s.to_string()),
                is_peer: true,
            });
        }
    }
    account.external_upstream_url.as_ref().map(|url| ReplicationSource {
        base_url: url.clone(),
        username: account.external_upstream_username.clone(),
        password: account.external_upstream_password.clone(),
        is_peer: false,
    })
}
