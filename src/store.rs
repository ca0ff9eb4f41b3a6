//! Session history persistence.
//!
//! History is append-only: every event a session process emits (plus every
//! user prompt) is written exactly once, whether or not any viewer is
//! attached. [`FileSessionStore`] keeps one JSON-lines file per session under
//! `data_dir/sessions/<id>/history.jsonl`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Errors from the history store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid session id {0:?}")]
    InvalidId(String),
    #[error("history I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode history entry: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Persisted conversation history.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn append_to_history(&self, session_id: &str, message: &Value) -> Result<(), StoreError>;
    /// Whether any history exists, i.e. a new process should resume.
    async fn exists(&self, session_id: &str) -> bool;
}

/// Session ids become directory names: alphanumeric, `-`, `_`, 1-128 chars.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// JSON-lines history files on local disk.
pub struct FileSessionStore {
    root: PathBuf,
    /// Serializes appends so concurrent writers never interleave lines.
    write_lock: Mutex<()>,
}

impl FileSessionStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("sessions"),
            write_lock: Mutex::new(()),
        }
    }

    fn history_path(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_session_id(session_id) {
            return Err(StoreError::InvalidId(session_id.to_string()));
        }
        Ok(self.root.join(session_id).join("history.jsonl"))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn append_to_history(&self, session_id: &str, message: &Value) -> Result<(), StoreError> {
        let path = self.history_path(session_id)?;
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn exists(&self, session_id: &str) -> bool {
        match self.history_path(session_id) {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }
}
