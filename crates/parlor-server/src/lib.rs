//! Store server: a `MemoryStore` served over WebSocket.

pub mod config;
pub mod connection;

use std::time::Duration;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::trace::TraceLayer;

use parlor_store::MemoryStore;

pub use config::ServerConfig;

#[derive(Clone)]
pub struct ServerState {
    pub store: MemoryStore,
    pub heartbeat: Duration,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/store", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn ws_upgrade(State(state): State<ServerState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.store, state.heartbeat)
    })
}

async fn health(State(state): State<ServerState>) -> impl IntoResponse {
    format!("ok {} connections", state.store.connection_count())
}
