use std::{path::PathBuf, sync::Arc, time::Duration};

use axum::{
    extract::{DefaultBodyLimit, State},
    middleware, routing,
    routing::{get, patch, post},
    Json, Router,
};
use clap::Parser;
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, Sqlite, SqlitePool};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing_subscriber::EnvFilter;

pub mod admin;
pub mod config;
pub mod db;
pub mod delete;
pub mod download;
pub mod error;
pub mod hasher;
pub mod lockout;
pub mod quota;
pub mod reaper;
pub mod resumable;
pub mod session;
pub mod storage;
pub mod token;
pub mod upload;

pub use config::AppConfiguration;
pub use error::AppError;

use storage::ObjectStore;

/// Everything the request handlers share. Cheap to clone; all members are
/// reference-counted or pooled.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub store: Arc<dyn ObjectStore>,
    pub conf: Arc<AppConfiguration>,
    pub lockout: Arc<lockout::LockoutLedger>,
    pub active_uploads: upload::ActiveUploads,
}

#[derive(Debug, Parser)]
#[clap(author, about, version)]
struct Args {
    /// Path to the configuration file.
    #[arg(long, default_value = "./config.toml")]
    config: PathBuf,

    /// Run the interactive setup wizard and exit.
    #[arg(long)]
    init: bool,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    if args.init {
        return config::setup_config(&args.config);
    }

    let conf: AppConfiguration = toml::from_str(&std::fs::read_to_string(&args.config).map_err(
        |e| anyhow::anyhow!("failed to read config at {:?}: {e} (try --init)", args.config),
    )?)?;

    // Fail fast with every configuration problem at once.
    let errors = conf.validate();
    if !errors.is_empty() {
        for error in &errors {
            eprintln!("config error: {error}");
        }
        anyhow::bail!("invalid configuration ({} problems)", errors.len());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(conf.translate_log_level().to_string())),
        )
        .init();

    // Create the database if it doesn't already exist.
    if !Sqlite::database_exists(&conf.database_url).await.unwrap_or(false) {
        tracing::info!(url = conf.database_url, "creating database");
        Sqlite::create_database(&conf.database_url).await?;
    }

    let db = SqlitePoolOptions::new()
        .max_connections(25)
        .acquire_timeout(Duration::from_secs(5))
        .max_lifetime(Duration::from_secs(300))
        .connect(&conf.database_url)
        .await?;

    // Perform migrations, if necessary. Errors here abort startup.
    sqlx::migrate!().run(&db).await?;
    tracing::info!("migrations are up to date");

    let store: Arc<dyn ObjectStore> = Arc::new(storage::S3ObjectStore::from_config(&conf).await);

    tokio::fs::create_dir_all(&conf.spool_dir).await?;

    let conf = Arc::new(conf);
    let state = AppState {
        db,
        store,
        conf: conf.clone(),
        lockout: Arc::new(lockout::LockoutLedger::new(
            conf.lockout_threshold,
            conf.lockout_window_secs,
            conf.lockout_duration_secs,
        )),
        active_uploads: Default::default(),
    };

    // Multipart framing carries some overhead on top of the payload itself.
    let body_limit = usize::try_from(conf.max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(1024 * 1024);

    // Short-lived JSON endpoints get a request timeout; the streaming
    // endpoints manage their own per-operation deadlines instead.
    let metadata_routes = Router::new()
        .route("/logout", post(session::logout_endpoint))
        .route(
            "/files",
            post(upload::register_endpoint).get(upload::list_files_endpoint),
        )
        .route("/files/{id}", routing::delete(delete::delete_file_endpoint))
        .route("/links", post(download::create_link_endpoint))
        .route("/quota", get(quota::quota_endpoint))
        .route("/admin/cleanup", post(admin::cleanup_endpoint))
        .route("/admin/files", get(admin::overview_endpoint))
        .route("/admin/users/{id}", routing::delete(admin::delete_user_endpoint))
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            session::require_auth,
        ));

    let streaming_routes = Router::new()
        .route("/upload", post(upload::upload_endpoint))
        .route("/upload/resumable", post(resumable::create_endpoint))
        .route(
            "/upload/resumable/{id}",
            patch(resumable::patch_endpoint).head(resumable::head_endpoint),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            session::require_auth,
        ));

    let public_routes = Router::new()
        .route("/login", post(session::login_endpoint))
        .route("/register", post(session::register_endpoint))
        .route("/download", get(download::download_endpoint))
        .route("/health", get(health_endpoint))
        .route("/ready", get(ready_endpoint));

    let app = Router::new()
        .merge(public_routes)
        .merge(metadata_routes)
        .merge(streaming_routes)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state.clone());

    // The cleanup task runs until the cancellation token fires on shutdown.
    let cancel = CancellationToken::new();
    if conf.cleanup_enabled {
        tokio::spawn(reaper::cleanup_task(state.clone(), cancel.clone()));
    } else {
        tracing::warn!("background cleanup is disabled; stale records will accumulate");
    }

    let listener = tokio::net::TcpListener::bind(&conf.interface).await?;
    tracing::info!(interface = conf.interface, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("received shutdown signal");
            cancel.cancel();
        })
        .await?;

    Ok(())
}

/// GET /health - process liveness, nothing else.
async fn health_endpoint() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /ready - 200 only while both the database and the object store answer.
async fn ready_endpoint(State(aps): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    sqlx::query("SELECT 1;")
        .execute(&aps.db)
        .await
        .map_err(|_| AppError::unavailable("database unreachable"))?;
    aps.store
        .ready()
        .await
        .map_err(|_| AppError::unavailable("object store unreachable"))?;
    Ok(Json(serde_json::json!({ "status": "ready" })))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Baseline configuration for the test suite; individual tests override
/// fields as needed.
#[cfg(test)]
pub fn test_config() -> AppConfiguration {
    toml::from_str(
        r#"
        interface = "127.0.0.1:0"
        public_base_url = "http://localhost:3000"
        database_url = "sqlite::memory:"
        session_secret = "test-session-secret-test-session-secret"
        download_secret = "test-download-secret-test-download-secret"
        admin_password_hash = "$2b$10$7EqJtq98hPqEX7fNZaFWoOhi5B0a6DQJIdrUxUcsnayUD7V1F5nxy"
        s3_endpoint = "http://localhost:9000"
        s3_region = "us-east-1"
        s3_access_key = "test"
        s3_secret_key = "test"
        s3_bucket = "test-bucket"
        max_upload_bytes = 1048576
        spool_dir = "./spool"
        secure_cookies = false
        log_level = "INFO"
        "#,
    )
    .unwrap()
}
