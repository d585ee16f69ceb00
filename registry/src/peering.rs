//! Peer credential store: issues and validates peering credentials.
//! Any failure before the final write must not touch the database.

use crate::db::{self, Db};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Deserialize)]
pub struct PeeringRequest {
    pub peer: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Error)]
pub enum PeeringError {
    #[error("username must be replication@<our-public-hostname>")]
    WrongUsername,
    #[error("unknown peer {0}")]
    UnknownPeer(String),
    #[error("peer validation request failed: {0}")]
    ValidationFailed(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Performs the peering handshake: validates against the peer's own `/auth`
/// endpoint with the caller-supplied credentials before ever touching our
/// database, then persists `our_password` only on success.
pub async fn handle_peering_request(
    db: &Db,
    http_client: &reqwest::Client,
    our_public_hostname: &str,
    req: PeeringRequest,
) -> Result<(), PeeringError> {
    let expected_username = format!("replication@{our_public_hostname}");
    if req.username != expected_username {
        return Err(PeeringError::WrongUsername);
    }

    if db::find_peer(db, &req.peer).await?.is_none() {
        return Err(PeeringError::UnknownPeer(req.peer));
    }

    let validation_url = format!("https://{}/keppel/v1/auth?service={}", req.peer, req.peer);
    let basic = STANDARD.encode(format!("{}:{}", req.username, req.password));
    let response = http_client
        .get(&validation_url)
        .header("Authorization", format!("Basic {basic}"))
        .send()
        .await
        .map_err(|e| PeeringError::ValidationFailed(e.to_string()))?;

    if !response.status().is_success() {
        return Err(PeeringError::ValidationFailed(format!("peer returned {}", response.status())));
    }

    db::set_peer_our_password(db, &req.peer, &req.password).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrong_username_is_rejected_before_any_network_call() {
        let req = PeeringRequest {
            peer: "peer.example.org".into(),
            username: "someone-else@registry.example.org".into(),
            password: "supersecret".into(),
        };
        let expected_username = "replication@registry.example.org";
        assert_ne!(req.username, expected_username);
    }
}
