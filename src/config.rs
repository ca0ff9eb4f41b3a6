//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `POCKODE_TOKEN`, `POCKODE_LISTEN`,
//!    `POCKODE_DATA_DIR`, `POCKODE_RELAY`, `LOG_LEVEL`, `LOG_FILE`, `LOG_FORMAT`
//! 2. **Config file**: path via `--config <path>`, or `pockode.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:9870"
//! frontend_port = 5173
//! data_dir = "~/.pockode"
//! work_dir = "."
//! idle_timeout_secs = 600
//! dev_mode = false
//!
//! [auth]
//! token = "your-secret-token"
//!
//! [agent]
//! command = "claude-bridge"
//! args = []
//!
//! [logging]
//! level = "info"
//! format = "text"        # or "json"
//!
//! # Optional: omit entirely to run without the cloud relay
//! [relay]
//! enabled = true
//! cloud_url = "https://cloud.pockode.com"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Optional cloud relay configuration.
    pub relay: Option<RelayConfig>,
}

/// Errors produced while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid listen address {0:?}")]
    Listen(String),
}

/// Local HTTP server and process-lifecycle settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `127.0.0.1:9870`). Its port is the
    /// backend port the relay proxies API, health and WS traffic to.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Loopback port of the frontend asset server (default 5173).
    #[serde(default = "default_frontend_port")]
    pub frontend_port: u16,
    /// Directory for persistent data (relay record, history, logs).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Working directory handed to agent processes.
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
    /// Seconds of inactivity before a session process is reaped (default 600).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Development mode: log to stdout instead of `data_dir/server.log`.
    #[serde(default)]
    pub dev_mode: bool,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Shared secret viewers present on connect. Override with `POCKODE_TOKEN`.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_token")]
    pub token: String,
}

/// Agent process launcher settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Executable started once per session process.
    #[serde(default = "default_agent_command")]
    pub command: String,
    /// Extra arguments placed before `--session-id`.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file path. Defaults to `data_dir/server.log` outside dev mode.
    pub file: Option<String>,
    /// `text` (default) or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Cloud relay settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Start the relay tunnel on boot (default false).
    #[serde(default)]
    pub enabled: bool,
    /// Base URL of the cloud control plane.
    #[serde(default = "default_cloud_url")]
    pub cloud_url: String,
    /// Version reported to the control plane on register/refresh.
    #[serde(default = "default_client_version")]
    pub client_version: String,
}

fn default_listen() -> String {
    "127.0.0.1:9870".to_string()
}
fn default_frontend_port() -> u16 {
    5173
}
fn default_data_dir() -> String {
    "~/.pockode".to_string()
}
fn default_work_dir() -> String {
    ".".to_string()
}
fn default_idle_timeout_secs() -> u64 {
    600
}
fn default_token() -> String {
    "change-me".to_string()
}
fn default_agent_command() -> String {
    "claude-bridge".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}
fn default_cloud_url() -> String {
    "https://cloud.pockode.com".to_string()
}
fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            frontend_port: default_frontend_port(),
            data_dir: default_data_dir(),
            work_dir: default_work_dir(),
            idle_timeout_secs: default_idle_timeout_secs(),
            dev_mode: false,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: default_token(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            format: default_log_format(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cloud_url: default_cloud_url(),
            client_version: default_client_version(),
        }
    }
}

impl ServerConfig {
    /// `data_dir` with a leading `~` expanded.
    pub fn data_dir(&self) -> PathBuf {
        expand_home(&self.data_dir)
    }

    /// `work_dir` with a leading `~` expanded.
    pub fn work_dir(&self) -> PathBuf {
        expand_home(&self.work_dir)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }

    /// Port component of `listen`.
    pub fn backend_port(&self) -> Result<u16, ConfigError> {
        self.listen
            .parse::<SocketAddr>()
            .map(|addr| addr.port())
            .map_err(|_| ConfigError::Listen(self.listen.clone()))
    }
}

/// Expand a leading `~` or `~/` to `$HOME`. Other paths pass through.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        if rest.is_empty() || rest.starts_with('/') {
            if let Some(home) = std::env::var_os("HOME") {
                return PathBuf::from(home).join(rest.trim_start_matches('/'));
            }
        }
    }
    PathBuf::from(path)
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `pockode.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("pockode.toml").exists() => Self::from_file("pockode.toml")?,
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(token) = var("POCKODE_TOKEN") {
            self.auth.token = token;
        }
        if let Some(listen) = var("POCKODE_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(dir) = var("POCKODE_DATA_DIR") {
            self.server.data_dir = dir;
        }
        if let Some(flag) = var("POCKODE_RELAY") {
            let enabled = matches!(flag.as_str(), "1" | "true" | "yes");
            self.relay.get_or_insert_with(RelayConfig::default).enabled = enabled;
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(file) = var("LOG_FILE") {
            self.logging.file = Some(file);
        }
        if let Some(format) = var("LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Relay settings when the tunnel is switched on.
    pub fn enabled_relay(&self) -> Option<&RelayConfig> {
        self.relay.as_ref().filter(|r| r.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_without_file() {
        let config = Config::default();
        assert_eq!(config.server.listen, "127.0.0.1:9870");
        assert_eq!(config.server.backend_port().unwrap(), 9870);
        assert_eq!(config.server.idle_timeout(), Duration::from_secs(600));
        assert!(config.enabled_relay().is_none());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:8080"
            idle_timeout_secs = 60

            [relay]
            enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(config.server.backend_port().unwrap(), 8080);
        assert_eq!(config.server.frontend_port, 5173);
        let relay = config.enabled_relay().unwrap();
        assert_eq!(relay.cloud_url, "https://cloud.pockode.com");
        assert_eq!(relay.client_version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = Config::default();
        let env: HashMap<&str, &str> = [
            ("POCKODE_TOKEN", "secret"),
            ("POCKODE_RELAY", "true"),
            ("LOG_FORMAT", "json"),
        ]
        .into_iter()
        .collect();
        config.apply_env(|k| env.get(k).map(ToString::to_string));
        assert_eq!(config.auth.token, "secret");
        assert_eq!(config.logging.format, "json");
        assert!(config.enabled_relay().is_some());
    }

    #[test]
    fn test_expand_home_leaves_plain_paths() {
        assert_eq!(expand_home("/var/lib/pockode"), PathBuf::from("/var/lib/pockode"));
        assert_eq!(expand_home("~user/x"), PathBuf::from("~user/x"));
    }

    #[test]
    fn test_invalid_listen_address() {
        let mut config = Config::default();
        config.server.listen = "not-an-address".to_string();
        assert!(matches!(
            config.server.backend_port(),
            Err(ConfigError::Listen(_))
        ));
    }
}
