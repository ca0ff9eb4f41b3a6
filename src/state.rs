//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::auth::AuthToken;
use crate::config::Config;
use crate::process::ProcessManager;
use crate::relay::RelayManager;
use crate::store::SessionStore;

/// Shared application state for the pockode server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Viewer shared secret.
    pub token: Arc<AuthToken>,
    /// Registry of running conversation processes and their viewers.
    pub processes: ProcessManager,
    /// Conversation history.
    pub store: Arc<dyn SessionStore>,
    /// Tunnel to the cloud relay (None when `[relay]` is disabled).
    pub relay: Option<Arc<RelayManager>>,
    /// Fires when the server begins shutting down; ends viewer loops.
    pub shutdown: CancellationToken,
}
