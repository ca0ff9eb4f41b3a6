//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /health`: liveness probe.
///
/// Reports version, uptime, running process count and whether the relay
/// tunnel is currently up.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let relay_connected = state.relay.as_ref().is_some_and(|r| r.is_connected());
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "processes": state.processes.process_count().await,
        "relay_connected": relay_connected,
    }))
}
