//! UserIdentity variants: tagged-variant principals with permission
//! predicates and an explicit registry for (de)serialization, replacing
//! module-init side-effect registration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("no identity variant registered for tag {0:?}")]
    NotRegistered(String),
    #[error("malformed identity payload for tag {0:?}: {1}")]
    MalformedPayload(String, serde_json::Error),
}

/// A principal that has been authenticated, one way or another.
pub trait UserIdentity: Send + Sync + std::fmt::Debug {
    /// The stable tag under which this variant is registered.
    fn tag(&self) -> &'static str;
    fn username(&self) -> String;
    fn is_anonymous(&self) -> bool {
        false
    }
    fn is_peer(&self) -> bool {
        false
    }
    fn can_view_account(&self, auth_tenant_id: &str) -> bool;
    fn can_pull_from_account(&self, auth_tenant_id: &str) -> bool;
    fn can_push_to_account(&self, _auth_tenant_id: &str) -> bool {
        false
    }
    fn can_delete_from_account(&self, _auth_tenant_id: &str) -> bool {
        false
    }
    fn can_change_account(&self, _auth_tenant_id: &str) -> bool {
        false
    }
    fn can_view_account_quota(&self, auth_tenant_id: &str) -> bool {
        self.can_view_account(auth_tenant_id)
    }
    fn can_change_account_quota(&self, _auth_tenant_id: &str) -> bool {
        false
    }
    /// Serializes this identity's own payload (without the tag).
    fn payload(&self) -> serde_json::Value;
}

/// `anon`: no permissions, empty username.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anonymous;

impl UserIdentity for Anonymous {
    fn tag(&self) -> &'static str {
        "anon"
    }
    fn username(&self) -> String {
        String::new()
    }
    fn is_anonymous(&self) -> bool {
        true
    }
    fn can_view_account(&self, _auth_tenant_id: &str) -> bool {
        false
    }
    fn can_pull_from_account(&self, _auth_tenant_id: &str) -> bool {
        false
    }
    fn payload(&self) -> serde_json::Value {
        serde_json::json!({})
    }
}

/// `repl`: a federated peer instance. Can view and pull from every account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub peer_hostname: String,
}

impl UserIdentity for PeerIdentity {
    fn tag(&self) -> &'static str {
        "repl"
    }
    fn username(&self) -> String {
        format!("replication@{}", self.peer_hostname)
    }
    fn is_peer(&self) -> bool {
        true
    }
    fn can_view_account(&self, _auth_tenant_id: &str) -> bool {
        true
    }
    fn can_pull_from_account(&self, _auth_tenant_id: &str) -> bool {
        true
    }
    fn payload(&self) -> serde_json::Value {
        serde_json::json!({ "peer_hostname": self.peer_hostname })
    }
}

/// `trivy`: the vulnerability scanner collaborator. Same rights as a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrivyIdentity;

impl UserIdentity for TrivyIdentity {
    fn tag(&self) -> &'static str {
        "trivy"
    }
    fn username(&self) -> String {
        "trivy".to_string()
    }
    fn can_view_account(&self, _auth_tenant_id: &str) -> bool {
        true
    }
    fn can_pull_from_account(&self, _auth_tenant_id: &str) -> bool {
        true
    }
    fn payload(&self) -> serde_json::Value {
        serde_json::json!({})
    }
}

/// A driver-reported identity: permissions and username come from an
/// `AuthDriver` implementation rather than being hardcoded here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverIdentity {
    pub username: String,
    pub viewable_tenants: Vec<String>,
    pub pull_tenants: Vec<String>,
    pub push_tenants: Vec<String>,
    pub delete_tenants: Vec<String>,
    pub change_tenants: Vec<String>,
    pub change_quota_tenants: Vec<String>,
}

impl UserIdentity for DriverIdentity {
    fn tag(&self) -> &'static str {
        "driver"
    }
    fn username(&self) -> String {
        self.username.clone()
    }
    fn can_view_account(&self, auth_tenant_id: &str) -> bool {
        self.viewable_tenants.iter().any(|t| t == auth_tenant_id)
    }
    fn can_pull_from_account(&self, auth_tenant_id: &str) -> bool {
        self.pull_tenants.iter().any(|t| t == auth_tenant_id)
    }
    fn can_push_to_account(&self, auth_tenant_id: &str) -> bool {
        self.push_tenants.iter().any(|t| t == auth_tenant_id)
    }
    fn can_delete_from_account(&self, auth_tenant_id: &str) -> bool {
        self.delete_tenants.iter().any(|t| t == auth_tenant_id)
    }
    fn can_change_account(&self, auth_tenant_id: &str) -> bool {
        self.change_tenants.iter().any(|t| t == auth_tenant_id)
    }
    fn can_change_account_quota(&self, auth_tenant_id: &str) -> bool {
        self.change_quota_tenants.iter().any(|t| t == auth_tenant_id)
    }
    fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("DriverIdentity always serializes")
    }
}

type Decoder = Arc<dyn Fn(serde_json::Value) -> Result<Arc<dyn UserIdentity>, serde_json::Error> + Send + Sync>;

/// Explicit registry of identity-variant decoders, populated at process
/// start via `register` calls rather than module-init side effects.
#[derive(Clone, Default)]
pub struct IdentityRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, tag: &'static str, decode: F)
    where
        F: Fn(serde_json::Value) -> Result<Arc<dyn UserIdentity>, serde_json::Error> + Send + Sync + 'static,
    {
        self.decoders.insert(tag, Arc::new(decode));
    }

    /// Builds the registry with the built-in variants (anon, repl, trivy,
    /// driver) already registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("anon", |_| Ok(Arc::new(Anonymous)));
        registry.register("repl", |payload| {
            let identity: PeerIdentity = serde_json::from_value(payload)?;
            Ok(Arc::new(identity) as Arc<dyn UserIdentity>)
        });
        registry.register("trivy", |_| Ok(Arc::new(TrivyIdentity)));
        registry.register("driver", |payload| {
            let identity: DriverIdentity = serde_json::from_value(payload)?;
            Ok(Arc::new(identity) as Arc<dyn UserIdentity>)
        });
        registry
    }

    /// Dispatches on `tag`; fails with `NotRegistered` on unknown tags.
    pub fn decode(&self, tag: &str, payload: serde_json::Value) -> Result<Arc<dyn UserIdentity>, IdentityError> {
        let decoder = self
            .decoders
            .get(tag)
            .ok_or_else(|| IdentityError::NotRegistered(tag.to_string()))?;
        decoder(payload).map_err(|e| IdentityError::MalformedPayload(tag.to_string(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_has_no_permissions() {
        let a = Anonymous;
        assert!(a.is_anonymous());
        assert_eq!(a.username(), "");
        assert!(!a.can_pull_from_account("tenant"));
    }

    #[test]
    fn peer_can_view_and_pull_any_account() {
        let p = PeerIdentity { peer_hostname: "peer.example.org".into() };
        assert!(p.is_peer());
        assert_eq!(p.username(), "replication@peer.example.org");
        assert!(p.can_view_account("anything"));
        assert!(p.can_pull_from_account("anything"));
    }

    #[test]
    fn driver_identity_scopes_by_tenant() {
        let d = DriverIdentity {
            username: "alice".into(),
            viewable_tenants: vec!["t1".into()],
            pull_tenants: vec!["t1".into()],
            push_tenants: vec![],
            delete_tenants: vec![],
            change_tenants: vec![],
            change_quota_tenants: vec![],
        };
        assert!(d.can_pull_from_account("t1"));
        assert!(!d.can_pull_from_account("t2"));
        assert!(!d.can_push_to_account("t1"));
    }

    #[test]
    fn registry_dispatches_on_tag() {
        let registry = IdentityRegistry::with_builtins();
        let identity = registry.decode("anon", serde_json::json!({})).unwrap();
        assert!(identity.is_anonymous());

        let identity = registry
            .decode("repl", serde_json::json!({ "peer_hostname": "peer.example.org" }))
            .unwrap();
        assert_eq!(identity.username(), "replication@peer.example.org");
    }

    #[test]
    fn registry_fails_on_unknown_tag() {
        let registry = IdentityRegistry::with_builtins();
        let err = registry.decode("unknown", serde_json::json!({})).unwrap_err();
        assert!(matches!(err, IdentityError::NotRegistered(tag) if tag == "unknown"));
    }
}
