use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Json, Router,
};
use moka::future::Cache;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod otp;
pub mod session;
pub mod sms;
pub mod storage;
pub mod sweeper;

pub struct AppState {
    pub db: sqlx::PgPool,
    pub otp: otp::OtpService,
    pub sms: sms::SmsClient,
    pub store: storage::ObjectStore,
    // Re-signed gallery URLs, keyed by object path
    pub url_cache: Cache<String, String>,
    pub config: config::AppConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = config::AppConfig::from_env();

    info!("Connecting to PostgreSQL...");
    let pool = PgPoolOptions::new()
        .max_connections(50)
        .connect(&config.database_url)
        .await?;
    info!("Connected to database.");

    sqlx::migrate!("./migrations").run(&pool).await?;

    let url_cache: Cache<String, String> = Cache::builder()
        .max_capacity(10_000)
        .time_to_live(Duration::from_secs(60 * 60))
        .build();

    let shared_state = Arc::new(AppState {
        db: pool,
        otp: otp::OtpService::new(config.otp.clone()),
        sms: sms::SmsClient::new(config.sms.clone()),
        store: storage::ObjectStore::new(config.storage.clone()),
        url_cache,
        config: config.clone(),
    });

    let cleanup_daemon = sweeper::CleanupDaemon::new(Arc::clone(&shared_state));
    tokio::spawn(async move {
        cleanup_daemon.start().await;
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    let app = Router::new()
        .route("/readyz", get(health_check))
        .route("/api/auth/send-otp", post(handlers::auth::send_otp))
        .route("/api/auth/verify-otp", post(handlers::auth::verify_otp))
        .route("/api/auth/session", get(handlers::auth::session_info))
        .route("/api/auth/logout", post(handlers::auth::logout))
        .route("/api/photos/list", get(handlers::photos::list_photos))
        .route("/api/upload/simple", post(handlers::upload::upload_simple))
        .route(
            "/api/upload/thumbnail",
            post(handlers::upload::stage_thumbnail),
        )
        .route("/api/admin/stats", get(handlers::admin::stats))
        .route("/api/admin/photos", get(handlers::admin::photos))
        .route("/api/admin/cleanup", post(handlers::admin::cleanup))
        // Full-resolution relay uploads go through multipart; allow well past
        // the per-event default of 10 MiB.
        .layer(DefaultBodyLimit::max(50 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(shared_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Keepsake gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "keepsake-gateway",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
