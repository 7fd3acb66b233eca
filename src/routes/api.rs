use axum::{routing::get, Router};
use std::sync::Arc;

use crate::handlers::{health_check, ready_check};
use crate::session::SessionRegistry;
use crate::ws::handler::websocket_handler;

/// Assemble the server routes: health surface plus the synchronization
/// WebSocket endpoint.
pub fn create_routes(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .route("/ws", get(websocket_handler))
        .with_state(registry)
}
