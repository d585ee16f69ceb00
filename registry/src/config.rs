use serde::{Deserialize, Serialize};
use std::env;
use std::fs;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub secrets: crate::secrets::SecretsConfig,

    /// The hostname this instance answers to as a primary/local audience.
    #[serde(default = "default_api_public_hostname")]
    pub api_public_hostname: String,
    /// Shared anycast hostname, if this instance participates in a
    /// federation's anycast read surface.
    #[serde(default)]
    pub anycast_api_public_hostname: Option<String>,

    #[serde(default)]
    pub issuer_keys: Vec<IssuerKey>,
    #[serde(default)]
    pub anycast_issuer_keys: Vec<IssuerKey>,

    #[serde(default = "default_token_lifetime_seconds")]
    pub token_lifetime_seconds: i64,
    #[serde(default = "default_scanner_token_lifetime_seconds")]
    pub scanner_token_lifetime_seconds: i64,
    #[serde(default = "default_clock_skew_seconds")]
    pub clock_skew_seconds: i64,

    #[serde(default)]
    pub correctly_return_403: bool,
}

fn default_api_public_hostname() -> String {
    "registry.example.org".to_string()
}

fn default_token_lifetime_seconds() -> i64 {
    4 * 3600
}

fn default_scanner_token_lifetime_seconds() -> i64 {
    20 * 60
}

fn default_clock_skew_seconds() -> i64 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    #[default]
    Local,
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub mode: StorageMode,
    #[serde(default = "default_storage_path")]
    pub path: String,
    #[serde(default = "default_s3_url")]
    pub s3_url: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default)]
    pub s3_region: Option<String>,
    #[serde(default)]
    pub s3_access_key: Option<String>,
    #[serde(default)]
    pub s3_secret_key: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::Local,
            path: default_storage_path(),
            s3_url: default_s3_url(),
            bucket: default_bucket(),
            s3_region: None,
            s3_access_key: None,
            s3_secret_key: None,
        }
    }
}

fn default_storage_path() -> String {
    "data/storage".to_string()
}

fn default_s3_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_bucket() -> String {
    "registry".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_database_url() -> String {
    "postgres://localhost/portcullis".to_string()
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub auth_rps: u32,
    pub auth_burst: u32,
    pub upload_rps: u32,
    pub upload_burst: u32,
    pub general_rps: u32,
    pub general_burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            auth_rps: 1,
            auth_burst: 5,
            upload_rps: 200,
            upload_burst: 500,
            general_rps: 100,
            general_burst: 200,
        }
    }
}

/// A named signing key. `key_pem` holds the private key material; the
/// concrete key type (Ed25519 / ECDSA / RSA) determines the JWT algorithm
/// used to sign with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerKey {
    pub kid: String,
    pub key_pem: String,
    pub key_type: IssuerKeyType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssuerKeyType {
    Ed25519,
    Ecdsa,
    Rsa,
}

impl Config {
    /// Load configuration with priority: ENV > config.toml > defaults
    pub fn load() -> Self {
        let mut config: Config = fs::read_to_string("config.toml")
            .ok()
            .and_then(|content| toml::from_str(&content).ok())
            .unwrap_or_default();

        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("PORTCULLIS_HOST") {
            self.server.host = val;
        }
        if let Ok(val) = env::var("PORTCULLIS_PORT") {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }

        if let Ok(val) = env::var("PORTCULLIS_API_PUBLIC_HOSTNAME") {
            self.api_public_hostname = val;
        }
        if let Ok(val) = env::var("PORTCULLIS_ANYCAST_API_PUBLIC_HOSTNAME") {
            self.anycast_api_public_hostname = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = env::var("PORTCULLIS_STORAGE_MODE") {
            self.storage.mode = match val.to_lowercase().as_str() {
                "s3" => StorageMode::S3,
                _ => StorageMode::Local,
            };
        }
        if let Ok(val) = env::var("PORTCULLIS_STORAGE_PATH") {
            self.storage.path = val;
        }
        if let Ok(val) = env::var("PORTCULLIS_STORAGE_S3_URL") {
            self.storage.s3_url = val;
        }
        if let Ok(val) = env::var("PORTCULLIS_STORAGE_BUCKET") {
            self.storage.bucket = val;
        }
        if let Ok(val) = env::var("PORTCULLIS_STORAGE_S3_REGION") {
            self.storage.s3_region = Some(val);
        }
        if let Ok(val) = env::var("PORTCULLIS_STORAGE_S3_ACCESS_KEY") {
            self.storage.s3_access_key = Some(val);
        }
        if let Ok(val) = env::var("PORTCULLIS_STORAGE_S3_SECRET_KEY") {
            self.storage.s3_secret_key = Some(val);
        }

        if let Ok(val) = env::var("PORTCULLIS_DATABASE_URL") {
            self.database.url = val;
        }

        if let Ok(val) = env::var("PORTCULLIS_RATELIMIT_AUTH_RPS") {
            if let Ok(v) = val.parse() {
                self.rate_limit.auth_rps = v;
            }
        }
        if let Ok(val) = env::var("PORTCULLIS_RATELIMIT_UPLOAD_RPS") {
            if let Ok(v) = val.parse() {
                self.rate_limit.upload_rps = v;
            }
        }
        if let Ok(val) = env::var("PORTCULLIS_RATELIMIT_GENERAL_RPS") {
            if let Ok(v) = val.parse() {
                self.rate_limit.general_rps = v;
            }
        }

        if let Ok(val) = env::var("PORTCULLIS_SECRETS_PROVIDER") {
            self.secrets.provider = val;
        }

        if let Ok(val) = env::var("PORTCULLIS_CORRECTLY_RETURN_403") {
            self.correctly_return_403 = val == "1" || val.eq_ignore_ascii_case("true");
        }
    }
}

/// Config fixture used by unit tests across modules; not read from disk.
#[cfg(test)]
pub fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.api_public_hostname = "registry.example.org".to_string();
    cfg.anycast_api_public_hostname = Some("registry-anycast.example.org".to_string());
    cfg
}
