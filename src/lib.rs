#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! pockode library: the server core behind the `pockode` binary.
//!
//! - `relay`: registration, the multiplexed tunnel, HTTP proxy and reconnects
//! - `process`: one agent process per session, fanned out to many viewers
//! - `agent`: agent process abstraction and the subprocess implementation
//! - `store`: conversation history on disk
//! - `ws`: viewer WebSocket protocol, shared by local and relayed viewers
//! - `routes`: local HTTP router
//! - `auth`: shared-secret comparison
//! - `config`: configuration loading
//! - `logging`: tracing setup and panic-guarded tasks

pub mod agent;
pub mod auth;
pub mod config;
pub mod logging;
pub mod process;
pub mod relay;
pub mod routes;
pub mod state;
pub mod store;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use process::ProcessManager;
pub use relay::RelayManager;
pub use state::AppState;
