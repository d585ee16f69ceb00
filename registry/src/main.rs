use axum::{extract::DefaultBodyLimit, middleware, Router};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use portcullis_registry::config::{Config, StorageMode};
use portcullis_registry::drivers::{InMemoryAuthDriver, InMemoryFederationDriver};
use portcullis_registry::identity::IdentityRegistry;
use portcullis_registry::replication::manifest::ManifestCache;
use portcullis_registry::storage::{KeyValueStorageDriver, Storage};
use portcullis_registry::uploads::UploadSessions;
use portcullis_registry::{db, health, metrics, rate_limit, request_id, routes, AppState};

#[derive(Parser)]
#[command(name = "portcullis", version, about = "Federated, multi-tenant OCI container registry")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the registry server (default)
    Serve,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(matches!(cli.command, None | Some(Commands::Serve)));

    let config = Config::load();

    let storage = match config.storage.mode {
        StorageMode::Local => {
            info!(path = %config.storage.path, "using local storage");
            Storage::new_local(&config.storage.path)
        }
        StorageMode::S3 => {
            info!(
                s3_url = %config.storage.s3_url,
                bucket = %config.storage.bucket,
                has_credentials = config.storage.s3_access_key.is_some(),
                "using S3 storage"
            );
            Storage::new_s3(
                &config.storage.s3_url,
                &config.storage.bucket,
                config.storage.s3_region.as_deref().unwrap_or("us-east-1"),
                config.storage.s3_access_key.as_deref(),
                config.storage.s3_secret_key.as_deref(),
            )
        }
    };

    match cli.command {
        None | Some(Commands::Serve) => run_server(config, storage).await,
    }
}

fn init_logging(json_format: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json_format {
        tracing_subscriber::registry().with(env_filter).with(fmt::layer().json().with_target(true)).init();
    } else {
        tracing_subscriber::registry().with(env_filter).with(fmt::layer().with_target(false)).init();
    }
}

async fn run_server(config: Config, storage: Storage) {
    let start_time = Instant::now();

    info!(
        auth_rps = config.rate_limit.auth_rps,
        upload_rps = config.rate_limit.upload_rps,
        general_rps = config.rate_limit.general_rps,
        "rate limiting configured"
    );

    if let Err(e) = portcullis_registry::secrets::create_secrets_provider(&config.secrets) {
        warn!(error = %e, "failed to initialize secrets provider, using defaults");
    }

    let db = match db::connect(&config).await {
        Ok(db) => db,
        Err(e) => {
            tracing::error!(error = %e, "failed to connect to database");
            std::process::exit(1);
        }
    };
    if let Err(e) = db::run_migrations(&db).await {
        tracing::error!(error = %e, "failed to apply database migrations");
        std::process::exit(1);
    }

    let auth_limiter = rate_limit::auth_rate_limiter(&config.rate_limit);
    let upload_limiter = rate_limit::upload_rate_limiter(&config.rate_limit);
    let general_limiter = rate_limit::general_rate_limiter(&config.rate_limit);

    let storage_driver = Arc::new(KeyValueStorageDriver::new(storage.clone()));
    let http_client = reqwest::Client::new();

    let state = Arc::new(AppState {
        db,
        storage,
        storage_driver,
        identity_registry: IdentityRegistry::with_builtins(),
        auth_driver: Arc::new(InMemoryAuthDriver::default()),
        federation_driver: Arc::new(InMemoryFederationDriver::new()),
        http_client,
        manifest_cache: ManifestCache::new(),
        upload_sessions: UploadSessions::new(),
        start_time,
        config,
    });

    // `/keppel/v1/auth` gets the strictest limiter to slow down token-endpoint
    // brute force; everything else under a registry scope shares the upload
    // limiter since layer uploads are the bursty case.
    let auth_routes = routes::auth::routes().layer(auth_limiter);
    let registry_routes = Router::new().merge(routes::registry::routes()).merge(routes::peer::routes()).layer(upload_limiter);

    let public_routes = Router::new().merge(health::routes()).merge(metrics::routes());

    let rate_limited_routes = Router::new().merge(auth_routes).merge(registry_routes).layer(general_limiter);

    let app = Router::new()
        .merge(public_routes)
        .merge(rate_limited_routes)
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024 * 1024))
        .layer(middleware::from_fn_with_state(state.clone(), routes::domain::domain_remap_middleware))
        .layer(middleware::from_fn(metrics::metrics_middleware))
        .layer(middleware::from_fn(request_id::request_id_middleware))
        .with_state(state.clone());

    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.expect("failed to bind listener");

    info!(
        address = %addr,
        version = env!("CARGO_PKG_VERSION"),
        api_public_hostname = %state.config.api_public_hostname,
        "registry started"
    );

    axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    info!(uptime_seconds = state.start_time.elapsed().as_secs(), "registry shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate()).expect("failed to install SIGTERM handler").recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, starting graceful shutdown..."),
        _ = terminate => info!("received SIGTERM, starting graceful shutdown..."),
    }
}
