//! Relay lifecycle: registration, tunnel supervision, shutdown.
//!
//! `start` resolves a registration record (refreshing a stored one, or
//! registering from scratch when there is none or its token was rejected),
//! persists it, and launches the reconnect loop. It returns as soon as the
//! public URL is known; the tunnel connects in the background.
//!
//! The reconnect loop dials the relay, performs the JSON-RPC `register`
//! handshake and hands the socket to a [`Multiplexer`] until it fails.
//! Failures back off from 1s up to 10s; a connection that stayed up for a
//! minute reconnects immediately. The loop runs under a panic guard and
//! stops only when [`RelayManager::stop`] cancels it.

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::client::{RegistrationClient, RegistrationError};
use super::frame::{RegisterRequest, RegisterResponse, MAX_FRAME_BYTES};
use super::http::HttpProxy;
use super::mux::Multiplexer;
use super::store::{ConfigStore, RegistrationRecord};
use super::stream::VirtualStream;
use super::RelayError;
use crate::config::RelayConfig;
use crate::logging::spawn_guarded;

/// Dial plus handshake must finish within this.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Pending virtual streams not yet taken by the local endpoint.
const NEW_STREAM_BUFFER: usize = 16;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct RelayManager {
    store: ConfigStore,
    client: RegistrationClient,
    proxy: Arc<HttpProxy>,
    remote_url: Mutex<String>,
    announcement: Mutex<String>,
    connected: Arc<AtomicBool>,
    streams_tx: Mutex<Option<mpsc::Sender<VirtualStream>>>,
    streams_rx: Mutex<Option<mpsc::Receiver<VirtualStream>>>,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RelayManager {
    pub fn new(
        config: &RelayConfig,
        data_dir: &Path,
        backend_port: u16,
        frontend_port: u16,
    ) -> Result<Self, RelayError> {
        let (tx, rx) = mpsc::channel(NEW_STREAM_BUFFER);
        Ok(Self {
            store: ConfigStore::new(data_dir),
            client: RegistrationClient::new(&config.cloud_url, &config.client_version)?,
            proxy: Arc::new(HttpProxy::new(backend_port, frontend_port)),
            remote_url: Mutex::new(String::new()),
            announcement: Mutex::new(String::new()),
            connected: Arc::new(AtomicBool::new(false)),
            streams_tx: Mutex::new(Some(tx)),
            streams_rx: Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
            task: tokio::sync::Mutex::new(None),
        })
    }

    /// Register or refresh, persist, and launch the tunnel. Returns the
    /// public URL. Calling it again while running returns the same URL.
    /// A concurrent [`stop`](Self::stop) aborts the control-plane calls.
    pub async fn start(&self) -> Result<String, RelayError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(self.remote_url());
        }
        let Some(new_streams) = lock(&self.streams_tx).clone() else {
            return Err(RelayError::Cancelled);
        };

        let mut record = tokio::select! {
            record = self.obtain_record() => record?,
            () = self.cancel.cancelled() => return Err(RelayError::Cancelled),
        };
        self.store.save(&record)?;
        let url = record.public_url();
        info!(subdomain = %record.subdomain, url = %url, "relay registration ready");

        let announcement = tokio::select! {
            text = self.client.announcement() => text,
            () = self.cancel.cancelled() => return Err(RelayError::Cancelled),
        };
        if !announcement.is_empty() {
            record.announcement = Some(announcement.clone());
            if let Err(e) = self.store.save(&record) {
                warn!("failed to persist announcement: {e}");
            }
        }
        *lock(&self.announcement) = announcement;
        *lock(&self.remote_url) = url.clone();

        let link = TunnelLink {
            url: record.tunnel_url(),
            token: record.relay_token,
            proxy: Arc::clone(&self.proxy),
            new_streams,
            connected: Arc::clone(&self.connected),
        };
        *task = Some(spawn_guarded(
            "relay_reconnect",
            run_with_reconnect(link, self.cancel.clone()),
        ));
        Ok(url)
    }

    /// Refresh the stored record, re-registering whenever none is usable.
    async fn obtain_record(&self) -> Result<RegistrationRecord, RelayError> {
        loop {
            let Some(stored) = self.store.load()? else {
                info!("registering with relay control plane");
                let record = self.client.register().await?;
                info!(subdomain = %record.subdomain, "registered with relay control plane");
                return Ok(record);
            };

            info!(subdomain = %stored.subdomain, "refreshing relay registration");
            match self.client.refresh(&stored.relay_token).await {
                Ok(mut record) => {
                    if record.relay_token.is_empty() {
                        record.relay_token = stored.relay_token;
                    }
                    return Ok(record);
                }
                Err(RegistrationError::InvalidToken) => {
                    warn!("stored relay token is invalid, re-registering");
                    self.store.delete()?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Cancel the tunnel, wait for the loop to exit, and end the
    /// new-streams channel.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("relay task ended abnormally: {e}");
            }
        }
        lock(&self.streams_tx).take();
        self.connected.store(false, Ordering::Relaxed);
        info!("relay stopped");
    }

    /// Receiver of newly opened virtual streams. Available once.
    pub fn new_streams(&self) -> Option<mpsc::Receiver<VirtualStream>> {
        lock(&self.streams_rx).take()
    }

    /// Public URL; empty before a successful `start`.
    pub fn remote_url(&self) -> String {
        lock(&self.remote_url).clone()
    }

    pub fn announcement(&self) -> String {
        lock(&self.announcement).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

/// Everything one reconnect loop needs, independent of the manager.
struct TunnelLink {
    url: String,
    token: String,
    proxy: Arc<HttpProxy>,
    new_streams: mpsc::Sender<VirtualStream>,
    connected: Arc<AtomicBool>,
}

impl TunnelLink {
    /// One full attempt: dial, handshake, multiplex. Returns why it ended.
    async fn connect_and_run(&self, cancel: &CancellationToken) -> RelayError {
        info!(url = %self.url, "connecting to relay");
        let ws = tokio::select! {
            attempt = tokio::time::timeout(CONNECT_TIMEOUT, self.connect()) => match attempt {
                Ok(Ok(ws)) => ws,
                Ok(Err(e)) => return e,
                Err(_) => return RelayError::Timeout,
            },
            () = cancel.cancelled() => return RelayError::Cancelled,
        };

        self.connected.store(true, Ordering::Relaxed);
        info!("connected to relay");
        let reason = Multiplexer::new(ws, Arc::clone(&self.proxy), self.new_streams.clone())
            .run(cancel.clone())
            .await;
        self.connected.store(false, Ordering::Relaxed);
        reason
    }

    async fn connect(
        &self,
    ) -> Result<
        WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        RelayError,
    > {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(MAX_FRAME_BYTES);
        config.max_frame_size = Some(MAX_FRAME_BYTES);
        let (mut ws, _) = connect_async_with_config(&self.url, Some(config), false)
            .await
            .map_err(|e| RelayError::Dial(Box::new(e)))?;
        handshake(&mut ws, &self.token).await?;
        Ok(ws)
    }
}

/// One connection attempt the reconnect loop repeats.
trait TunnelAttempt: Send + Sync + 'static {
    fn run_once(&self, cancel: &CancellationToken) -> impl Future<Output = RelayError> + Send;
}

impl TunnelAttempt for TunnelLink {
    async fn run_once(&self, cancel: &CancellationToken) -> RelayError {
        self.connect_and_run(cancel).await
    }
}

/// JSON-RPC `register` exchange at the start of every tunnel connection.
pub(crate) async fn handshake<S>(ws: &mut WebSocketStream<S>, token: &str) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = serde_json::to_string(&RegisterRequest::new(token))?;
    ws.send(Message::Text(request.into())).await?;
    loop {
        match ws.next().await {
            None | Some(Ok(Message::Close(_))) => return Err(RelayError::ConnectionClosed),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(Message::Text(text))) => {
                let status = serde_json::from_str::<RegisterResponse>(&text)?.into_status()?;
                debug!(status = %status, "relay accepted registration");
                return Ok(());
            }
            Some(Ok(_)) => {}
        }
    }
}

async fn run_with_reconnect<A: TunnelAttempt>(link: A, cancel: CancellationToken) {
    let mut backoff = Backoff::default();
    while !cancel.is_cancelled() {
        let started = Instant::now();
        let reason = link.run_once(&cancel).await;
        if cancel.is_cancelled() {
            break;
        }
        match backoff.after_failure(started.elapsed()) {
            None => warn!(error = %reason, "relay connection lost after a stable run, reconnecting"),
            Some(delay) => {
                warn!(error = %reason, backoff_secs = delay.as_secs(), "relay connection failed");
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => break,
                }
            }
        }
    }
    debug!("relay reconnect loop exited");
}
