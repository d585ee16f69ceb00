//! Core of a federated, multi-tenant OCI container registry: token-based
//! authorization, manifest/blob replication, and the manifest ingestion
//! and reference-graph processor, wired behind an Axum HTTP surface.

pub mod account;
pub mod audience;
pub mod auth;
pub mod config;
pub mod db;
pub mod drivers;
pub mod error;
pub mod health;
pub mod identity;
pub mod ingestion;
pub mod metrics;
pub mod peering;
pub mod rate_limit;
pub mod refgraph;
pub mod replication;
pub mod request_id;
pub mod routes;
pub mod scope;
pub mod secrets;
pub mod storage;
pub mod token;
pub mod uploads;
pub mod validation;

use std::sync::Arc;
use std::time::Instant;

use config::Config;
use db::Db;
use drivers::{AuthDriver, FederationDriver};
use identity::IdentityRegistry;
use replication::manifest::ManifestCache;
use storage::{Storage, StorageDriver};
use uploads::UploadSessions;

/// Shared application state, built once in `main` and threaded through
/// every handler via axum's `State` extractor.
pub struct AppState {
    pub db: Db,
    pub storage: Storage,
    pub storage_driver: Arc<dyn StorageDriver>,
    pub config: Config,
    pub identity_registry: IdentityRegistry,
    pub auth_driver: Arc<dyn AuthDriver>,
    pub federation_driver: Arc<dyn FederationDriver>,
    pub http_client: reqwest::Client,
    pub manifest_cache: ManifestCache,
    pub upload_sessions: UploadSessions,
    pub start_time: Instant,
}
