//! Chat server: websocket hub plus the REST routes the client consumes.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post},
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::info;
use uuid::Uuid;

pub mod hub;
pub mod rest;
pub mod store;
pub mod ws;


use crate::config::{AuthConfig, ServerConfig};
use crate::metrics::ServerMetrics;
use hub::Hub;
use store::ChatStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ChatStore>,
    pub hub: Arc<Hub>,
    pub auth: Arc<AuthConfig>,
    pub config: Arc<ServerConfig>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
}

impl AppState {
    pub fn new(config: ServerConfig, auth: AuthConfig) -> Self {
        Self {
            store: Arc::new(ChatStore::new(config.max_message_len)),
            hub: Arc::new(Hub::new()),
            auth: Arc::new(auth),
            config: Arc::new(config),
            metrics: Arc::new(ServerMetrics::new()),
        }
    }
}

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route(
            "/api/conversations",
            get(rest::list_conversations).post(rest::create_conversation),
        )
        .route("/api/conversations/{id}/messages", get(rest::get_messages))
        .route("/api/conversations/{id}/read", post(rest::mark_read))
        .route("/api/conversations/{id}/archive", post(rest::archive))
        .route("/health", get(rest::health_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("Bazaar chat listening on http://{}", addr);
    info!("  GET  /ws                             - chat websocket");
    info!("  GET  /api/conversations              - list conversations");
    info!("  POST /api/conversations              - open a conversation");
    info!("  GET  /api/conversations/{{id}}/messages - message history");
    info!("  POST /api/conversations/{{id}}/read    - mark read");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Server error")
}

#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    use crate::config::ServerFileConfig;
    AppState::new(
        ServerConfig::from_file(&ServerFileConfig::default()),
        AuthConfig::default(),
    )
}
