//! Tracing initialisation and panic-guarded background tasks.
//!
//! Outside dev mode logs go to `data_dir/server.log` (or `LOG_FILE`), in dev
//! mode to stdout. `LOG_FORMAT=json` switches to the JSON formatter.

use std::any::Any;
use std::backtrace::Backtrace;
use std::fs::OpenOptions;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Mutex;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. If the log file cannot be
/// opened, logging falls back to stdout and the reason is printed to stderr.
pub fn init(config: &Config) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    let builder = tracing_subscriber::fmt().with_env_filter(EnvFilter::new(filter));
    let json = config.logging.format.eq_ignore_ascii_case("json");

    let file = log_file_path(config).and_then(|path| {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                eprintln!("failed to create log directory {}: {e}", parent.display());
                return None;
            }
        }
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => Some(f),
            Err(e) => {
                eprintln!("failed to open log file {}: {e}", path.display());
                None
            }
        }
    });

    match (json, file) {
        (true, Some(f)) => builder.json().with_writer(Mutex::new(f)).init(),
        (true, None) => builder.json().init(),
        (false, Some(f)) => builder.with_ansi(false).with_writer(Mutex::new(f)).init(),
        (false, None) => builder.init(),
    }
}

fn log_file_path(config: &Config) -> Option<PathBuf> {
    match &config.logging.file {
        Some(file) => Some(PathBuf::from(file)),
        None if !config.server.dev_mode => Some(config.server.data_dir().join("server.log")),
        None => None,
    }
}

/// Spawn a background task that logs and swallows panics instead of letting
/// them unwind into the runtime.
///
/// The panic payload and a backtrace are written to the log and to stderr.
pub fn spawn_guarded<F>(name: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(payload) = AssertUnwindSafe(fut).catch_unwind().await {
            log_panic(name, payload.as_ref());
        }
    })
}

/// Log a recovered panic with a backtrace.
pub fn log_panic(task: &str, payload: &(dyn Any + Send)) {
    let message = panic_message(payload);
    let backtrace = Backtrace::force_capture();
    error!(task, panic = %message, backtrace = %backtrace, "background task panicked");
    eprintln!("fatal: {task} panicked: {message}\n{backtrace}");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
