mod errors;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::engine::Dispatcher;
use crate::limiter::RateLimiter;
use crate::session::SessionManager;
use crate::storage::Store;
use crate::tools::ToolRegistry;

/// Shared application state accessible by all handlers.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub dispatcher: Arc<Dispatcher>,
    pub sessions: Arc<SessionManager>,
    pub registry: Arc<ToolRegistry>,
    pub limiter: Arc<RateLimiter>,
}

/// Build the REST router. Kept separate from [`serve`] so tests can drive
/// it in-process.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/dispatch", post(handlers::dispatch))
        .route("/session/event", post(handlers::session_event))
        .route("/status", get(handlers::status))
        .route("/runs", get(handlers::list_runs))
        .route("/runs/{id}", get(handlers::get_run))
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the REST API server.
pub async fn serve(host: &str, port: u16, state: Arc<AppState>) -> Result<()> {
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("mentorflow API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
