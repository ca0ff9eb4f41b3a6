//! HTTP route handlers.
//!
//! | Method | Path      | Auth   | Description                     |
//! |--------|-----------|--------|---------------------------------|
//! | GET    | `/health` | No     | Liveness probe                  |
//! | GET    | `/ws`     | Token* | Viewer WebSocket                |
//!
//! *Either `?token=<secret>` on the upgrade or an `auth` message first.

pub mod health;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::{ws, AppState};

/// Build the local router. The relay proxy forwards backend paths here too.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/ws", get(ws::ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
