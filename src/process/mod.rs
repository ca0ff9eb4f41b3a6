//! Session process registry with multi-viewer fan-out.
//!
//! [`ProcessManager`] is the single authority for running conversation
//! processes. Processes and viewer subscriptions have independent lifecycles:
//!
//! - **Registry**: at most one [`Entry`] per session id. Check-and-create
//!   holds the registry lock across the agent start, so concurrent attaches
//!   from several viewers start exactly one process.
//! - **Subscriptions**: viewers subscribe to a session id whether or not a
//!   process exists yet, and receive its events once one does.
//! - **Draining**: one task per entry consumes the process's events in
//!   order, appends each to history (even with no viewers), and broadcasts
//!   it to every current subscriber.
//! - **Idle reaping**: a ticker at a quarter of the idle timeout removes and
//!   closes entries nobody has touched for longer than the timeout.
//!
//! ## Concurrency
//!
//! The registry and the subscriber map each sit behind their own
//! `tokio::sync::Mutex`; neither is held while the other is taken. An entry's
//! `last_active` has its own small lock. A process is closed by whichever
//! path removed its entry from the registry, so it is closed exactly once.
//! Processes run under the manager's cancellation token, never a viewer's.

pub mod viewer;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{Agent, AgentError, AgentEvent, AgentProcess, AgentSession};
use crate::logging::spawn_guarded;
use crate::store::SessionStore;
pub use viewer::Viewer;

/// Upper bound on one broadcast write to a single viewer.
const VIEWER_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors reported to callers of the manager.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("process manager is shut down")]
    ShutDown,
    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// Event as persisted to history and delivered to viewers.
#[derive(Serialize)]
pub struct ServerMessage<'a> {
    pub session_id: &'a str,
    #[serde(flatten)]
    pub event: &'a AgentEvent,
}

/// A registered, running conversation process.
///
/// Only ever shared by reference while registered; do not hold on to one
/// past a viewer request.
pub struct Entry {
    session_id: String,
    session: Arc<dyn AgentSession>,
    last_active: std::sync::Mutex<Instant>,
}

impl Entry {
    fn new(session_id: String, session: Arc<dyn AgentSession>) -> Self {
        Self {
            session_id,
            session,
            last_active: std::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Control handle of the underlying process.
    pub fn session(&self) -> &Arc<dyn AgentSession> {
        &self.session
    }

    fn touch(&self) {
        let mut last = self
            .last_active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *last = Instant::now();
    }

    fn last_active(&self) -> Instant {
        *self
            .last_active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Cloneable handle; all clones share the same registries.
#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<Inner>,
}

struct Inner {
    agent: Arc<dyn Agent>,
    store: Arc<dyn SessionStore>,
    work_dir: PathBuf,
    idle_timeout: Duration,
    entries: Mutex<HashMap<String, Arc<Entry>>>,
    subs: Mutex<HashMap<String, Vec<Arc<Viewer>>>>,
    cancel: CancellationToken,
}

impl ProcessManager {
    /// Create a manager and start its idle reaper. Must be called inside a
    /// tokio runtime.
    pub fn new(
        agent: Arc<dyn Agent>,
        store: Arc<dyn SessionStore>,
        work_dir: PathBuf,
        idle_timeout: Duration,
    ) -> Self {
        let inner = Arc::new(Inner {
            agent,
            store,
            work_dir,
            idle_timeout,
            entries: Mutex::new(HashMap::new()),
            subs: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });
        spawn_guarded(
            "idle_reaper",
            run_idle_reaper(Arc::downgrade(&inner), inner.cancel.clone(), idle_timeout),
        );
        Self { inner }
    }

    /// Return the running process for `session_id`, starting one if needed.
    ///
    /// The bool is `true` when this call started the process. An existing
    /// entry has its last-active time refreshed.
    pub async fn get_or_create_process(
        &self,
        session_id: &str,
        resume: bool,
    ) -> Result<(Arc<Entry>, bool), ProcessError> {
        let mut entries = self.inner.entries.lock().await;
        if let Some(entry) = entries.get(session_id) {
            entry.touch();
            return Ok((Arc::clone(entry), false));
        }
        if self.inner.cancel.is_cancelled() {
            return Err(ProcessError::ShutDown);
        }

        let AgentProcess { session, events } = self
            .inner
            .agent
            .start(
                self.inner.cancel.clone(),
                &self.inner.work_dir,
                session_id,
                resume,
            )
            .await?;

        let entry = Arc::new(Entry::new(session_id.to_string(), session));
        entries.insert(session_id.to_string(), Arc::clone(&entry));
        drop(entries);

        spawn_guarded(
            "event_drain",
            drain_events(Arc::downgrade(&self.inner), Arc::clone(&entry), events),
        );

        info!(session_id, resume, "created session process");
        Ok((entry, true))
    }

    /// The running process for `session_id`, without creating one.
    pub async fn get_process(&self, session_id: &str) -> Option<Arc<Entry>> {
        self.inner.entries.lock().await.get(session_id).cloned()
    }

    pub async fn has_process(&self, session_id: &str) -> bool {
        self.inner.entries.lock().await.contains_key(session_id)
    }

    /// Refresh the last-active time of a running process.
    pub async fn touch(&self, session_id: &str) {
        if let Some(entry) = self.inner.entries.lock().await.get(session_id) {
            entry.touch();
        }
    }

    /// Count of running processes.
    pub async fn process_count(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    /// Subscribe `viewer` to a session's events. Returns `false` if it was
    /// already subscribed.
    pub async fn subscribe(&self, session_id: &str, viewer: &Arc<Viewer>) -> bool {
        let mut subs = self.inner.subs.lock().await;
        let list = subs.entry(session_id.to_string()).or_default();
        if list.iter().any(|v| v.id() == viewer.id()) {
            return false;
        }
        list.push(Arc::clone(viewer));
        debug!(session_id, viewer = %viewer.id(), total = list.len(), "subscribed to session");
        true
    }

    /// Remove one subscription. Unknown pairs are ignored.
    pub async fn unsubscribe(&self, session_id: &str, viewer: &Viewer) {
        let mut subs = self.inner.subs.lock().await;
        if let Some(list) = subs.get_mut(session_id) {
            list.retain(|v| v.id() != viewer.id());
            debug!(session_id, viewer = %viewer.id(), total = list.len(), "unsubscribed from session");
            if list.is_empty() {
                subs.remove(session_id);
            }
        }
    }

    /// Drop every subscription held by a departed viewer.
    pub async fn unsubscribe_all(&self, viewer: &Viewer) {
        let mut subs = self.inner.subs.lock().await;
        subs.retain(|_, list| {
            list.retain(|v| v.id() != viewer.id());
            !list.is_empty()
        });
    }

    pub async fn subscriber_count(&self, session_id: &str) -> usize {
        self.inner
            .subs
            .lock()
            .await
            .get(session_id)
            .map_or(0, Vec::len)
    }

    /// Remove and terminate one process. Returns `true` if it was running.
    pub async fn close(&self, session_id: &str) -> bool {
        let removed = self.inner.entries.lock().await.remove(session_id);
        match removed {
            Some(entry) => {
                entry.session.close().await;
                info!(session_id, "closed session process");
                true
            }
            None => false,
        }
    }

    /// Stop background work and terminate every registered process.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let entries: Vec<Arc<Entry>> = self
            .inner
            .entries
            .lock()
            .await
            .drain()
            .map(|(_, e)| e)
            .collect();
        for entry in &entries {
            entry.session.close().await;
        }
        info!(closed = entries.len(), "process manager shutdown complete");
    }
}

impl Inner {
    /// Serialize-once fan-out to a snapshot of the current subscribers.
    async fn broadcast(&self, session_id: &str, text: &str) {
        let viewers: Vec<Arc<Viewer>> = self
            .subs
            .lock()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default();

        for viewer in viewers {
            match tokio::time::timeout(VIEWER_WRITE_TIMEOUT, viewer.send(text.to_string())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(session_id, viewer = %viewer.id(), "broadcast write failed: {e}"),
                Err(_) => warn!(session_id, viewer = %viewer.id(), "broadcast write timed out"),
            }
        }
    }

    /// Remove `entry` only if it is still the registered one for its id.
    async fn remove_if_current(&self, entry: &Arc<Entry>) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get(&entry.session_id) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                entries.remove(&entry.session_id);
                true
            }
            _ => false,
        }
    }

    async fn reap_idle(&self) {
        let now = Instant::now();
        let expired: Vec<Arc<Entry>> = {
            let mut entries = self.entries.lock().await;
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, e)| now.saturating_duration_since(e.last_active()) > self.idle_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };
        for entry in expired {
            entry.session.close().await;
            info!(session_id = %entry.session_id, "reaped idle session process");
        }
    }
}

/// Consume one process's events for its whole life.
async fn drain_events(
    manager: Weak<Inner>,
    entry: Arc<Entry>,
    mut events: mpsc::Receiver<AgentEvent>,
) {
    let session_id = entry.session_id.clone();
    while let Some(event) = events.recv().await {
        let Some(inner) = manager.upgrade() else {
            return;
        };
        debug!(session_id = %session_id, kind = ?event.kind, "streaming event");

        let message = ServerMessage {
            session_id: &session_id,
            event: &event,
        };
        let value = match serde_json::to_value(&message) {
            Ok(v) => v,
            Err(e) => {
                error!(session_id = %session_id, "failed to encode event: {e}");
                continue;
            }
        };

        if let Err(e) = inner.store.append_to_history(&session_id, &value).await {
            error!(session_id = %session_id, "failed to append to history: {e}");
        }
        inner.broadcast(&session_id, &value.to_string()).await;
    }

    if let Some(inner) = manager.upgrade() {
        if inner.remove_if_current(&entry).await {
            info!(session_id = %session_id, "session process ended");
        }
    }
}

async fn run_idle_reaper(manager: Weak<Inner>, cancel: CancellationToken, idle_timeout: Duration) {
    let period = (idle_timeout / 4).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = cancel.cancelled() => return,
        }
        let Some(inner) = manager.upgrade() else {
            return;
        };
        inner.reap_idle().await;
    }
}
