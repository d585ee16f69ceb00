use crate::audience::{identify_audience, Audience};
use crate::config::Config;
use crate::db::{self, Db};
use crate::drivers::AuthDriver;
use crate::error::AppError;
use crate::identity::{Anonymous, DriverIdentity, IdentityRegistry, PeerIdentity, UserIdentity};
use crate::scope::{is_info_access_scope, ScopeSet};
use crate::token;
use base64::{engine::general_purpose::STANDARD, Engine};
use std::sync::Arc;

/// What an endpoint requires from the authorization pipeline.
pub struct IncomingRequest {
    pub scopes: ScopeSet,
    pub anycast_acceptable: bool,
    pub domain_remapping_acceptable: bool,
    /// Used only by the token-issuance endpoint, to allow Basic auth and to
    /// pin the audience without re-resolving it from the request host.
    pub audience_for_token_issuance: Option<Audience>,
    pub partial_access_allowed: bool,
    pub no_implicit_anonymous: bool,
    /// True for GET/HEAD; anycast audiences only ever serve reads.
    pub is_safe_method: bool,
}

/// `WWW-Authenticate: Bearer realm="...",service="...",scope="..."`.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub auth_endpoint_url: String,
    pub audience_hostname: String,
    pub scopes: ScopeSet,
}

impl Challenge {
    pub fn header_value(&self) -> String {
        let mut parts = vec![
            format!("realm=\"{}\"", self.auth_endpoint_url),
            format!("service=\"{}\"", self.audience_hostname),
        ];
        for scope in self.scopes.iter() {
            if is_info_access_scope(scope) {
                continue;
            }
            parts.push(format!("scope=\"{}\"", scope.to_wire()));
        }
        format!("Bearer {}", parts.join(","))
    }
}

pub struct Authorization {
    pub identity: Arc<dyn UserIdentity>,
    pub audience: Audience,
    pub scopes: ScopeSet,
}

/// Resolves the audience for this request: the pinned value for
/// token-issuance, otherwise the host the request arrived at.
fn resolve_audience(cfg: &Config, incoming: &IncomingRequest, request_host: &str) -> Audience {
    if let Some(audience) = &incoming.audience_for_token_issuance {
        return audience.clone();
    }
    identify_audience(request_host, cfg)
}

pub async fn authorize(
    cfg: &Config,
    db: &Db,
    identity_registry: &IdentityRegistry,
    auth_driver: &dyn AuthDriver,
    request_host: &str,
    auth_header: Option<&str>,
    incoming: &IncomingRequest,
) -> Result<(Authorization, Challenge), AppError> {
    let audience = resolve_audience(cfg, incoming, request_host);

    if audience.anycast && !incoming.is_safe_method {
        return Err(AppError::Unsupported("anycast audience only supports GET/HEAD".to_string()));
    }
    if audience.anycast && !incoming.anycast_acceptable {
        return Err(AppError::Unsupported("anycast audience not accepted at this endpoint".to_string()));
    }
    if audience.is_domain_remapped() && !incoming.domain_remapping_acceptable {
        return Err(AppError::Unsupported("domain-remapped audience not accepted at this endpoint".to_string()));
    }

    let challenge = Challenge {
        auth_endpoint_url: format!("https://{}/keppel/v1/auth", cfg.api_public_hostname),
        audience_hostname: audience.hostname(cfg),
        scopes: incoming.scopes.clone(),
    };

    let identity = dispatch_credentials(cfg, db, identity_registry, auth_driver, auth_header, incoming, &audience).await?;
    let had_bearer_token = matches!(auth_header, Some(h) if h.starts_with("Bearer "));

    let granted = crate::auth::scope_filter::filter_scopes(db, identity.as_ref(), &audience, &incoming.scopes)
        .await
        .map_err(AppError::from)?;

    if !incoming.partial_access_allowed {
        for scope in incoming.scopes.iter() {
            if is_info_access_scope(scope) {
                continue;
            }
            if !granted.contains(scope) {
                let detail = scope.to_wire();
                if identity.is_anonymous() && !incoming.no_implicit_anonymous {
                    return Err(AppError::Unauthorized(detail));
                }
                return Err(AppError::insufficient_scope(had_bearer_token, identity.is_anonymous(), cfg.correctly_return_403, detail));
            }
        }
    }

    Ok((Authorization { identity, audience: audience.clone(), scopes: granted }, challenge))
}

async fn dispatch_credentials(
    cfg: &Config,
    db: &Db,
    identity_registry: &IdentityRegistry,
    auth_driver: &dyn AuthDriver,
    auth_header: Option<&str>,
    incoming: &IncomingRequest,
    audience: &Audience,
) -> Result<Arc<dyn UserIdentity>, AppError> {
    match auth_header {
        Some(h) if h.starts_with("Basic ") => {
            if incoming.audience_for_token_issuance.is_none() {
                return Err(AppError::Unauthorized("basic auth only accepted at token issuance".to_string()));
            }
            let (username, password) = decode_basic(h)?;
            if let Some(peer_hostname) = username.strip_prefix("replication@") {
                let peer = db::find_peer(db, peer_hostname)
                    .await
                    .map_err(AppError::from)?
                    .ok_or_else(|| AppError::Unauthorized("unknown peer".to_string()))?;
                if peer_password_matches(&peer, &password) {
                    return Ok(Arc::new(PeerIdentity { peer_hostname: peer_hostname.to_string() }));
                }
                return Err(AppError::Unauthorized("peer password mismatch".to_string()));
            }
            let identity = auth_driver
                .authenticate_user(&username, &password)
                .await
                .map_err(|_| AppError::Unauthorized("invalid credentials".to_string()))?;
            Ok(Arc::new(identity))
        }

        Some(h) if h.starts_with("Bearer ") => {
            let raw = h.trim_start_matches("Bearer ").trim();
            let verified = token::verify_token(cfg, identity_registry, raw, &audience.hostname(cfg))
                .map_err(|e| AppError::Unauthorized(e.to_string()))?;
            Ok(verified.identity)
        }

        None | Some("keppel") => {
            if let Some(identity) = auth_driver.authenticate_user_from_request(None).await {
                return Ok(Arc::new(identity));
            }
            if !incoming.no_implicit_anonymous && auth_header != Some("keppel") {
                return Ok(Arc::new(Anonymous));
            }
            Err(AppError::Unauthorized("no credentials presented".to_string()))
        }

        Some(_) => Err(AppError::MalformedAuthHeader),
    }
}

fn decode_basic(header: &str) -> Result<(String, String), AppError> {
    let encoded = header.trim_start_matches("Basic ").trim();
    let decoded = STANDARD
        .decode(encoded)
        .map_err(|_| AppError::MalformedAuthHeader)?;
    let text = String::from_utf8(decoded).map_err(|_| AppError::MalformedAuthHeader)?;
    let (user, pass) = text.split_once(':').ok_or(AppError::MalformedAuthHeader)?;
    Ok((user.to_string(), pass.to_string()))
}

/// bcrypt-compares against the current hash then the previous one, so a
/// password rotation doesn't invalidate an in-flight peer.
pub fn peer_password_matches(peer: &db::models::Peer, password: &str) -> bool {
    if let Some(current) = &peer.their_current_password_hash {
        if bcrypt::verify(password, current).unwrap_or(false) {
            return true;
        }
    }
    if let Some(previous) = &peer.their_previous_password_hash {
        if bcrypt::verify(password, previous).unwrap_or(false) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_basic_splits_on_first_colon() {
        let header = format!("Basic {}", STANDARD.encode("replication@registry.example.org:sup:er"));
        let (user, pass) = decode_basic(&header).unwrap();
        assert_eq!(user, "replication@registry.example.org");
        assert_eq!(pass, "sup:er");
    }

    #[test]
    fn peer_password_matches_current_or_previous_hash() {
        let current = bcrypt::hash("current-pw", bcrypt::DEFAULT_COST).unwrap();
        let previous = bcrypt::hash("previous-pw", bcrypt::DEFAULT_COST).unwrap();
        let peer = db::models::Peer {
            hostname: "peer.example.org".into(),
            our_password: "x".into(),
            their_current_password_hash: Some(current),
            their_previous_password_hash: Some(previous),
        };
        assert!(peer_password_matches(&peer, "current-pw"));
        assert!(peer_password_matches(&peer, "previous-pw"));
        assert!(!peer_password_matches(&peer, "wrong-pw"));
    }
}
