//! AuthDriver and FederationDriver: abstract collaborator interfaces
//! Only their interfaces are defined here; concrete
//! production implementations (LDAP, OpenStack, a real federation
//! service) are out of scope. Each trait ships an in-memory test double.

use crate::identity::DriverIdentity;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthDriverError {
    #[error("authentication failed")]
    Unauthorized,
    #[error("driver error: {0}")]
    Other(String),
}

/// Consults an external identity directory (LDAP, OpenStack Keystone,
/// etc). Only the interface is in scope; see `InMemoryAuthDriver` for a
/// test double.
#[async_trait]
pub trait AuthDriver: Send + Sync {
    async fn authenticate_user(&self, username: &str, password: &str) -> Result<DriverIdentity, AuthDriverError>;

    /// Cookie/SPNEGO/etc-based authentication from request context that
    /// isn't a bare `Authorization` header value.
    async fn authenticate_user_from_request(&self, cookie: Option<&str>) -> Option<DriverIdentity>;
}

pub struct InMemoryAuthDriver {
    users: HashMap<String, (String, DriverIdentity)>,
}

impl InMemoryAuthDriver {
    pub fn new() -> Self {
        Self { users: HashMap::new() }
    }

    pub fn with_user(mut self, username: &str, password: &str, identity: DriverIdentity) -> Self {
        self.users.insert(username.to_string(), (password.to_string(), identity));
        self
    }
}

impl Default for InMemoryAuthDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthDriver for InMemoryAuthDriver {
    async fn authenticate_user(&self, username: &str, password: &str) -> Result<DriverIdentity, AuthDriverError> {
        match self.users.get(username) {
            Some((expected_password, identity)) if expected_password == password => Ok(identity.clone()),
            _ => Err(AuthDriverError::Unauthorized),
        }
    }

    async fn authenticate_user_from_request(&self, _cookie: Option<&str>) -> Option<DriverIdentity> {
        None
    }
}

#[derive(Debug, Error)]
pub enum FederationError {
    #[error("claim errored: {0}")]
    ClaimErrored(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Succeeded,
    Failed,
}

/// Claims/forfeits an account name on behalf of a replica during account
/// lifecycle operations.
#[async_trait]
pub trait FederationDriver: Send + Sync {
    async fn claim_account_name(&self, account_name: &str, sublease_token: &str) -> Result<ClaimOutcome, FederationError>;

    async fn forfeit_account_name(&self, account_name: &str) -> Result<(), FederationError>;
}

pub struct InMemoryFederationDriver {
    valid_sublease_tokens: Arc<parking_lot::Mutex<HashMap<String, String>>>,
}

impl InMemoryFederationDriver {
    pub fn new() -> Self {
        Self { valid_sublease_tokens: Arc::new(parking_lot::Mutex::new(HashMap::new())) }
    }

    pub fn issue_sublease_token(&self, account_name: &str, token: &str) {
        self.valid_sublease_tokens.lock().insert(account_name.to_string(), token.to_string());
    }
}

impl Default for InMemoryFederationDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FederationDriver for InMemoryFederationDriver {
    async fn claim_account_name(&self, account_name: &str, sublease_token: &str) -> Result<ClaimOutcome, FederationError> {
        let tokens = self.valid_sublease_tokens.lock();
        match tokens.get(account_name) {
            Some(expected) if expected == sublease_token => Ok(ClaimOutcome::Succeeded),
            _ => Ok(ClaimOutcome::Failed),
        }
    }

    async fn forfeit_account_name(&self, _account_name: &str) -> Result<(), FederationError> {
        Ok(())
    }
}
