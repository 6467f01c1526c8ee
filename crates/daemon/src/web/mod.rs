//! HTTP/WebSocket surface.
//!
//! The alternate front end for browser clients: REST endpoints for board
//! and ticket CRUD, and a WebSocket at `/ws` whose JSON envelopes mirror
//! the binary protocol. Everything routes into the same broker and board
//! operations; the daemon binds `localhost` only.

pub mod api;
pub mod messages;
pub mod ws;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::broker::Broker;

/// Default HTTP port when `PORT` is unset.
pub const DEFAULT_PORT: u16 = 4200;

/// Shared state for all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
}

/// Build the router.
pub fn router(broker: Arc<Broker>) -> Router {
    let state = AppState { broker };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(api::health))
        .route("/api/board", get(api::get_board))
        .route("/api/tickets", get(api::list_tickets).post(api::create_ticket))
        .route(
            "/api/tickets/{id}",
            get(api::get_ticket)
                .patch(api::update_ticket)
                .delete(api::delete_ticket),
        )
        .route("/api/tickets/{id}/move", post(api::move_ticket))
        .route("/ws", get(ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve HTTP on `localhost:port` until the broker shuts down.
pub async fn serve(broker: Arc<Broker>, port: u16) -> anyhow::Result<()> {
    let shutdown = broker.shutdown_token();
    let app = router(broker);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    info!(port, "HTTP surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
