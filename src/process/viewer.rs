//! Write-locked viewer connections.
//!
//! A [`Viewer`] wraps whatever carries text to one connected client (a local
//! WebSocket, a relay virtual stream, a test channel). All writers, whether
//! the viewer's own request handler or a session broadcast, queue on the same
//! lock so frames never interleave.

use std::pin::Pin;
use std::sync::Arc;

use futures::{Sink, SinkExt};
use tokio::sync::Mutex;
use uuid::Uuid;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type TextSink = Pin<Box<dyn Sink<String, Error = BoxError> + Send>>;

/// One connected viewer. Identity is the generated id, not the sink.
pub struct Viewer {
    id: Uuid,
    sink: Mutex<TextSink>,
}

impl Viewer {
    pub fn new<S>(sink: S) -> Arc<Self>
    where
        S: Sink<String> + Send + 'static,
        S::Error: Into<BoxError>,
    {
        Arc::new(Self {
            id: Uuid::new_v4(),
            sink: Mutex::new(Box::pin(sink.sink_map_err(|e| -> BoxError { e.into() }))),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Write one text frame under this viewer's lock.
    pub async fn send(&self, text: String) -> Result<(), BoxError> {
        self.sink.lock().await.send(text).await
    }

    /// Serialize `value` and send it.
    pub async fn send_json<T: serde::Serialize>(&self, value: &T) -> Result<(), BoxError> {
        let text = serde_json::to_string(value)?;
        self.send(text).await
    }

    /// Flush and close the underlying sink.
    pub async fn close(&self) {
        let _ = self.sink.lock().await.close().await;
    }
}

impl std::fmt::Debug for Viewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Viewer").field("id", &self.id).finish()
    }
}
