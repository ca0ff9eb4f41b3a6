#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # pockode
//!
//! Local agent server. Viewers (a browser on the same machine, or a phone
//! through the cloud relay) attach to conversation sessions over WebSocket;
//! each session is backed by one agent process whose events are fanned out to
//! every attached viewer and appended to history.
//!
//! ## Subcommands
//!
//! - `pockode serve` (default): run the server
//!
//! ## API surface
//!
//! | Method | Path      | Auth   | Description            |
//! |--------|-----------|--------|------------------------|
//! | GET    | `/health` | No     | Liveness probe         |
//! | GET    | `/ws`     | Token* | Viewer WebSocket       |
//!
//! *`?token=<secret>` on the upgrade, or an `auth` message first.
//!
//! With `[relay] enabled = true` the server also registers with the cloud
//! control plane and keeps an outbound tunnel open. Relayed HTTP requests are
//! proxied to this server or to the frontend dev server; relayed WebSocket
//! connections become viewers.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          entry point, clap subcommands, startup, graceful shutdown
//! config.rs        TOML + env-var configuration
//! logging.rs       tracing setup, panic-guarded tasks
//! auth.rs          constant-time token comparison
//! agent/           Agent traits, event model, subprocess agent
//! store.rs         JSONL conversation history
//! process/         ProcessManager (registry, subscribers, drain, idle reaper)
//! relay/           registration, frames, mux, virtual streams, proxy, reconnects
//! ws/              viewer protocol over local sockets and virtual streams
//! routes/          router, GET /health
//! ```

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pockode::agent::CommandAgent;
use pockode::auth::AuthToken;
use pockode::store::FileSessionStore;
use pockode::{logging, routes, ws, AppState, Config, ProcessManager, RelayManager};

/// Local agent server with an outbound relay tunnel.
#[derive(Parser)]
#[command(name = "pockode", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server (default when no subcommand given).
    Serve,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Serve) | None => run_server(cli.config.as_deref()).await,
    }
}

async fn run_server(config_path: Option<&str>) -> ExitCode {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("pockode: {e}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&config);

    info!("pockode v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    let token = Arc::new(AuthToken::new(config.auth.token.clone()));
    if token.is_default() {
        warn!("Using default token, set POCKODE_TOKEN or update config");
    }

    let backend_port = match config.server.backend_port() {
        Ok(port) => port,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let data_dir = config.server.data_dir();
    let store = Arc::new(FileSessionStore::new(&data_dir));
    let agent = Arc::new(CommandAgent::new(
        config.agent.command.clone(),
        config.agent.args.clone(),
    ));
    let processes = ProcessManager::new(
        agent,
        store.clone(),
        config.server.work_dir(),
        config.server.idle_timeout(),
    );

    let relay = match config.enabled_relay() {
        Some(rc) => {
            match RelayManager::new(rc, &data_dir, backend_port, config.server.frontend_port) {
                Ok(manager) => Some(Arc::new(manager)),
                Err(e) => {
                    error!("relay disabled: {e}");
                    None
                }
            }
        }
        None => None,
    };

    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        token,
        processes,
        store,
        relay,
        shutdown: CancellationToken::new(),
    };

    let listener = match TcpListener::bind(&state.config.server.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {}: {e}", state.config.server.listen);
            return ExitCode::FAILURE;
        }
    };
    info!("Server ready");

    let acceptor = match &state.relay {
        Some(relay) => start_relay(&state, relay).await,
        None => None,
    };

    let app = routes::router(state.clone());
    let shutdown = state.shutdown.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        wait_for_signal().await;
        shutdown.cancel();
    });
    let result = serve.await;

    info!("Shutting down...");
    state.shutdown.cancel();
    if let Some(relay) = &state.relay {
        relay.stop().await;
    }
    if let Some(acceptor) = acceptor {
        let _ = acceptor.await;
    }
    state.processes.shutdown().await;

    match result {
        Ok(()) => {
            info!("Goodbye");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("server error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Bring the tunnel up and route its virtual streams to the viewer loop.
/// A failed start leaves the server running locally.
async fn start_relay(
    state: &AppState,
    relay: &Arc<RelayManager>,
) -> Option<tokio::task::JoinHandle<()>> {
    match relay.start().await {
        Ok(url) => {
            info!("Remote access: {url}");
            let announcement = relay.announcement();
            if !announcement.is_empty() {
                info!("{announcement}");
            }
        }
        Err(e) => {
            error!("relay failed to start: {e}");
            return None;
        }
    }
    relay
        .new_streams()
        .map(|streams| ws::spawn_stream_acceptor(state.clone(), streams))
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("failed to register SIGTERM handler: {e}");
                let _ = ctrl_c.await;
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("Received SIGINT");
    }
}
