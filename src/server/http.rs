use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, http::HeaderValue, routing::get};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::api::{self, AppState, SharedState};
use super::assistant::{AssistantPipeline, GeminiGenerator};
use super::db::{DbHandle, RoomDb};
use super::gatekeeper::CredentialVerifier;
use super::ws;
use crate::config::ServerConfig;

/// Build the full application router: HTTP API plus the room WebSocket.
pub fn build_router(state: SharedState, config: &ServerConfig) -> Router {
    let app = api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    match cors_layer(config) {
        Some(cors) => app.layer(cors),
        None => app,
    }
}

fn cors_layer(config: &ServerConfig) -> Option<CorsLayer> {
    if config.dev_mode {
        return Some(CorsLayer::permissive());
    }
    if config.allowed_origins.is_empty() {
        return None;
    }
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    Some(
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

/// Open the database at `config.db_path`, creating its directory.
pub fn open_database(config: &ServerConfig) -> Result<DbHandle> {
    if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = RoomDb::new(&config.db_path).context("Failed to initialize room database")?;
    Ok(DbHandle::new(db))
}

/// Assemble application state from configuration.
pub fn build_state(config: &ServerConfig, db: DbHandle) -> SharedState {
    let assistant = config.assistant_api_key.as_ref().map(|key| {
        let generator = GeminiGenerator::new(
            config.assistant_base_url.clone(),
            config.assistant_model.clone(),
            key.clone(),
        );
        AssistantPipeline::new(Arc::new(generator), config.assistant_timeout)
    });
    if assistant.is_none() {
        info!("GEMINI_API_KEY not set, @ai requests will be ignored");
    }
    Arc::new(AppState::new(
        db,
        CredentialVerifier::new(&config.jwt_secret),
        assistant,
    ))
}

/// Serve `app` on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")
}

/// Start the room server.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    if config.uses_default_secret() {
        warn!("JWT_SECRET not set, using the development secret");
    }
    let db = open_database(&config)?;
    let state = build_state(&config, db);
    let app = build_router(state, &config);

    let listener = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.http_addr))?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "commsync listening");

    serve(listener, app, shutdown_signal()).await?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
