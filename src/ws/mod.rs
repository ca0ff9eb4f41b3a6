//! WebSocket transport for conversation viewers.
//!
//! ## Connection lifecycle
//!
//! 1. Local clients connect to `GET /ws`, optionally with `?token=<secret>`.
//!    A wrong query token refuses the upgrade with `401`; without one the
//!    first message must be `auth`.
//! 2. Connections forwarded by the relay arrive as virtual streams and run
//!    the same loop, always starting unauthenticated.
//! 3. All messages are JSON objects with a `"type"` field.
//! 4. On disconnect the viewer is unsubscribed from every session. Running
//!    processes are left alone; they belong to the process manager.
//!
//! ## Message types (client → server)
//!
//! | Type                  | Fields                                  | Response                  |
//! |-----------------------|-----------------------------------------|---------------------------|
//! | `auth`                | `token`                                 | `auth_response`           |
//! | `attach`              | `session_id`                            | `attach_response`         |
//! | `detach`              | `session_id`                            | -                         |
//! | `message`             | `session_id`, `content`                 | agent events, or `error`  |
//! | `interrupt`           | `session_id`                            | `error` on failure        |
//! | `permission_response` | `session_id`, `request_id`, `choice`    | `error` on failure        |
//! | `question_response`   | `session_id`, `request_id`, `answers?`  | `error` on failure        |
//!
//! ## Message types (server → client)
//!
//! | Type              | Key fields                                  |
//! |-------------------|---------------------------------------------|
//! | `auth_response`   | `success`                                   |
//! | `attach_response` | `session_id`, `process_running`             |
//! | agent event types | `session_id`, `type`, event fields          |
//! | `error`           | `error`, `session_id?`                      |

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::PermissionChoice;
use crate::process::{ProcessError, Viewer};
use crate::relay::{RelayError, VirtualStream};
use crate::store::is_valid_session_id;
use crate::AppState;

/// Query parameters for the WebSocket upgrade request.
#[derive(Deserialize)]
pub struct WsQuery {
    /// Browsers cannot set headers on an upgrade, so the secret may ride
    /// along as a query parameter.
    pub token: Option<String>,
}

/// `GET /ws`: WebSocket upgrade handler.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let authenticated = match query.token.as_deref() {
        Some(token) if state.token.verify(token) => true,
        Some(_) => return (StatusCode::UNAUTHORIZED, "Invalid token").into_response(),
        None => false,
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, authenticated))
}

async fn handle_socket(socket: WebSocket, state: AppState, authenticated: bool) {
    let (sink, stream) = socket.split();
    let viewer = Viewer::new(text_sink(sink));
    let incoming = futures::stream::unfold(stream, |mut stream| async move {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Some((text.to_string(), stream)),
                Some(Ok(Message::Close(_)) | Err(_)) | None => return None,
                Some(Ok(_)) => {}
            }
        }
    });
    info!(viewer = %viewer.id(), "viewer connected");
    serve_connection(state, Box::pin(incoming), viewer, authenticated).await;
}

fn text_sink<S>(sink: S) -> impl Sink<String, Error = axum::Error> + Send + 'static
where
    S: Sink<Message, Error = axum::Error> + Send + 'static,
{
    sink.with(|text: String| futures::future::ready(Ok::<_, axum::Error>(Message::Text(text.into()))))
}

/// Serve one relay-forwarded connection until either side closes it.
///
/// Each inbound chunk is one UTF-8 message; replies go back as stream data.
pub async fn serve_virtual_stream(state: AppState, stream: VirtualStream) {
    let stream_id = stream.id().to_string();
    let (reader, writer) = stream.split();
    let closer = writer.clone();

    let sink = futures::sink::unfold(writer, |writer, text: String| async move {
        writer.send(Bytes::from(text)).await?;
        Ok::<_, RelayError>(writer)
    });
    let incoming = futures::stream::unfold(reader, |mut reader| async move {
        loop {
            let Some(chunk) = reader.recv().await else {
                return None;
            };
            match String::from_utf8(chunk.to_vec()) {
                Ok(text) => return Some((text, reader)),
                Err(_) => warn!("dropping non-UTF-8 chunk on virtual stream"),
            }
        }
    });

    let viewer = Viewer::new(sink);
    info!(stream_id = %stream_id, viewer = %viewer.id(), "relay viewer connected");
    serve_connection(state, Box::pin(incoming), viewer, false).await;
    closer.close().await;
}

/// Hand every virtual stream from the relay to its own viewer loop.
pub fn spawn_stream_acceptor(
    state: AppState,
    mut streams: mpsc::Receiver<VirtualStream>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(stream) = streams.recv().await {
            tokio::spawn(serve_virtual_stream(state.clone(), stream));
        }
        debug!("virtual stream acceptor finished");
    })
}

/// Main viewer loop, shared by local sockets and relay streams.
pub async fn serve_connection<S>(
    state: AppState,
    mut incoming: S,
    viewer: Arc<Viewer>,
    mut authenticated: bool,
) where
    S: Stream<Item = String> + Unpin,
{
    loop {
        let text = tokio::select! {
            next = incoming.next() => match next {
                Some(text) => text,
                None => break,
            },
            () = state.shutdown.cancelled() => break,
        };
        let conn = Conn {
            state: &state,
            viewer: &viewer,
        };
        if conn.handle_text(&text, &mut authenticated).await == Flow::Close {
            break;
        }
    }

    state.processes.unsubscribe_all(&viewer).await;
    viewer.close().await;
    info!(viewer = %viewer.id(), "viewer disconnected");
}

const MESSAGE_TYPES: [&str; 7] = [
    "auth",
    "attach",
    "detach",
    "message",
    "interrupt",
    "permission_response",
    "question_response",
];

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Auth {
        token: String,
    },
    Attach {
        session_id: String,
    },
    Detach {
        session_id: String,
    },
    Message {
        session_id: String,
        content: String,
    },
    Interrupt {
        session_id: String,
    },
    PermissionResponse {
        session_id: String,
        request_id: String,
        choice: String,
    },
    QuestionResponse {
        session_id: String,
        request_id: String,
        #[serde(default)]
        answers: Option<HashMap<String, String>>,
    },
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerReply<'a> {
    AuthResponse {
        success: bool,
    },
    AttachResponse {
        session_id: &'a str,
        process_running: bool,
    },
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<&'a str>,
    },
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

struct Conn<'a> {
    state: &'a AppState,
    viewer: &'a Arc<Viewer>,
}

impl Conn<'_> {
    async fn reply(&self, reply: &ServerReply<'_>) {
        if let Err(e) = self.viewer.send_json(reply).await {
            debug!(viewer = %self.viewer.id(), "reply not delivered: {e}");
        }
    }

    async fn error(&self, error: impl Into<String>, session_id: Option<&str>) {
        self.reply(&ServerReply::Error {
            error: error.into(),
            session_id,
        })
        .await;
    }

    async fn handle_text(&self, text: &str, authenticated: &mut bool) -> Flow {
        let msg = match parse(text) {
            Ok(msg) => msg,
            Err(reason) => {
                if !*authenticated {
                    self.error("Authentication required", None).await;
                    return Flow::Close;
                }
                self.error(reason, None).await;
                return Flow::Continue;
            }
        };

        if let ClientMessage::Auth { token } = &msg {
            let success = self.state.token.verify(token);
            self.reply(&ServerReply::AuthResponse { success }).await;
            if !success {
                warn!(viewer = %self.viewer.id(), "viewer failed authentication");
                return Flow::Close;
            }
            *authenticated = true;
            return Flow::Continue;
        }
        if !*authenticated {
            self.error("Authentication required", None).await;
            return Flow::Close;
        }

        self.dispatch(msg).await;
        Flow::Continue
    }

    async fn dispatch(&self, msg: ClientMessage) {
        let processes = &self.state.processes;
        match msg {
            ClientMessage::Auth { .. } => {}
            ClientMessage::Attach { session_id } => {
                if !is_valid_session_id(&session_id) {
                    self.error("Invalid session id", Some(&session_id)).await;
                    return;
                }
                let is_new = processes.subscribe(&session_id, self.viewer).await;
                processes.touch(&session_id).await;
                let process_running = processes.has_process(&session_id).await;
                debug!(session_id = %session_id, is_new, process_running, "viewer attached");
                self.reply(&ServerReply::AttachResponse {
                    session_id: &session_id,
                    process_running,
                })
                .await;
            }
            ClientMessage::Detach { session_id } => {
                processes.unsubscribe(&session_id, self.viewer).await;
            }
            ClientMessage::Message {
                session_id,
                content,
            } => {
                if let Err(e) = self.send_prompt(&session_id, &content).await {
                    warn!(session_id = %session_id, "message failed: {e}");
                    self.error(e.to_string(), Some(&session_id)).await;
                }
            }
            ClientMessage::Interrupt { session_id } => {
                let result: Result<(), ProcessError> = match processes.get_process(&session_id).await {
                    Some(entry) => entry.session().send_interrupt().await.map_err(Into::into),
                    None => Err(ProcessError::NotFound(session_id.clone())),
                };
                self.report(&session_id, result).await;
            }
            ClientMessage::PermissionResponse {
                session_id,
                request_id,
                choice,
            } => {
                let result: Result<(), ProcessError> = match processes.get_process(&session_id).await {
                    Some(entry) => entry
                        .session()
                        .send_permission_response(&request_id, PermissionChoice::parse(&choice))
                        .await
                        .map_err(Into::into),
                    None => Err(ProcessError::NotFound(session_id.clone())),
                };
                self.report(&session_id, result).await;
            }
            ClientMessage::QuestionResponse {
                session_id,
                request_id,
                answers,
            } => {
                let result: Result<(), ProcessError> = match processes.get_process(&session_id).await {
                    Some(entry) => entry
                        .session()
                        .send_question_response(&request_id, answers)
                        .await
                        .map_err(Into::into),
                    None => Err(ProcessError::NotFound(session_id.clone())),
                };
                self.report(&session_id, result).await;
            }
        }
    }

    async fn report(&self, session_id: &str, result: Result<(), ProcessError>) {
        match result {
            Ok(()) => self.state.processes.touch(session_id).await,
            Err(e) => {
                warn!(session_id, "viewer request failed: {e}");
                self.error(e.to_string(), Some(session_id)).await;
            }
        }
    }

    /// Get-or-create the process, record the prompt, and forward it.
    async fn send_prompt(&self, session_id: &str, content: &str) -> Result<(), ProcessError> {
        if !is_valid_session_id(session_id) {
            return Err(ProcessError::NotFound(session_id.to_string()));
        }
        let processes = &self.state.processes;
        processes.subscribe(session_id, self.viewer).await;

        let resume = self.state.store.exists(session_id).await;
        let (entry, created) = processes.get_or_create_process(session_id, resume).await?;
        if created {
            info!(session_id, resume, "started process for viewer message");
        }

        let record = json!({"type": "message", "session_id": session_id, "content": content});
        if let Err(e) = self.state.store.append_to_history(session_id, &record).await {
            warn!(session_id, "failed to append prompt to history: {e}");
        }
        info!(session_id, length = content.len(), "received prompt");
        entry.session().send_message(content).await?;
        Ok(())
    }
}

/// Parse one viewer message into a typed request, or the error text to
/// send back.
fn parse(text: &str) -> Result<ClientMessage, &'static str> {
    const INVALID: &str = "Invalid message format";
    let value: Value = serde_json::from_str(text).map_err(|_| INVALID)?;
    let kind = value.get("type").and_then(Value::as_str).ok_or(INVALID)?;
    if !MESSAGE_TYPES.contains(&kind) {
        return Err("Unknown message type");
    }
    serde_json::from_value(value).map_err(|_| INVALID)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentError, AgentEvent, AgentProcess, AgentSession};
    use crate::auth::AuthToken;
    use crate::config::Config;
    use crate::process::ProcessManager;
    use crate::store::{SessionStore, StoreError};
    use async_trait::async_trait;
    use futures::channel::mpsc as fmpsc;
    use std::path::Path;
    use std::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;

    type Log = Arc<std::sync::Mutex<Vec<String>>>;

    #[derive(Default)]
    struct RecordingAgent {
        inputs: Log,
        senders: std::sync::Mutex<Vec<tokio::sync::mpsc::Sender<AgentEvent>>>,
    }

    struct RecordingSession {
        inputs: Log,
    }

    #[async_trait]
    impl AgentSession for RecordingSession {
        async fn send_message(&self, content: &str) -> Result<(), AgentError> {
            self.inputs.lock().unwrap().push(format!("message:{content}"));
            Ok(())
        }
        async fn send_interrupt(&self) -> Result<(), AgentError> {
            self.inputs.lock().unwrap().push("interrupt".into());
            Ok(())
        }
        async fn send_permission_response(
            &self,
            request_id: &str,
            choice: PermissionChoice,
        ) -> Result<(), AgentError> {
            self.inputs
                .lock()
                .unwrap()
                .push(format!("permission:{request_id}:{choice:?}"));
            Ok(())
        }
        async fn send_question_response(
            &self,
            request_id: &str,
            answers: Option<HashMap<String, String>>,
        ) -> Result<(), AgentError> {
            self.inputs
                .lock()
                .unwrap()
                .push(format!("question:{request_id}:{}", answers.is_some()));
            Ok(())
        }
        async fn close(&self) {}
    }

    #[async_trait]
    impl Agent for RecordingAgent {
        async fn start(
            &self,
            _cancel: CancellationToken,
            _work_dir: &Path,
            _session_id: &str,
            _resume: bool,
        ) -> Result<AgentProcess, AgentError> {
            let (tx, rx) = tokio::sync::mpsc::channel(8);
            self.senders.lock().unwrap().push(tx);
            Ok(AgentProcess {
                session: Arc::new(RecordingSession {
                    inputs: Arc::clone(&self.inputs),
                }),
                events: rx,
            })
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        lines: std::sync::Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl SessionStore for MemoryStore {
        async fn append_to_history(&self, _session_id: &str, message: &Value) -> Result<(), StoreError> {
            self.lines.lock().unwrap().push(message.clone());
            Ok(())
        }
        async fn exists(&self, _session_id: &str) -> bool {
            !self.lines.lock().unwrap().is_empty()
        }
    }

    struct Harness {
        state: AppState,
        agent: Arc<RecordingAgent>,
        store: Arc<MemoryStore>,
    }

    fn harness() -> Harness {
        let agent = Arc::new(RecordingAgent::default());
        let store = Arc::new(MemoryStore::default());
        let processes = ProcessManager::new(
            agent.clone(),
            store.clone(),
            ".".into(),
            Duration::from_secs(600),
        );
        let state = AppState {
            config: Arc::new(Config::default()),
            start_time: Instant::now(),
            token: Arc::new(AuthToken::new("secret")),
            processes,
            store: store.clone(),
            relay: None,
            shutdown: CancellationToken::new(),
        };
        Harness { state, agent, store }
    }

    struct Client {
        tx: fmpsc::UnboundedSender<String>,
        rx: fmpsc::UnboundedReceiver<String>,
        task: JoinHandle<()>,
    }

    impl Client {
        fn connect(state: &AppState, authenticated: bool) -> Self {
            let (tx, incoming) = fmpsc::unbounded();
            let (out, rx) = fmpsc::unbounded();
            let viewer = Viewer::new(out);
            let task = tokio::spawn(serve_connection(
                state.clone(),
                incoming,
                viewer,
                authenticated,
            ));
            Self { tx, rx, task }
        }

        fn send(&self, msg: Value) {
            self.tx.unbounded_send(msg.to_string()).unwrap();
        }

        async fn recv(&mut self) -> Value {
            let text = tokio::time::timeout(Duration::from_secs(2), self.rx.next())
                .await
                .unwrap()
                .unwrap();
            serde_json::from_str(&text).unwrap()
        }
    }

    #[tokio::test]
    async fn test_first_message_must_be_auth() {
        let h = harness();
        let mut client = Client::connect(&h.state, false);
        client.send(json!({"type": "attach", "session_id": "s1"}));
        let reply = client.recv().await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["error"], "Authentication required");
        client.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_success_and_failure() {
        let h = harness();
        let mut client = Client::connect(&h.state, false);
        client.send(json!({"type": "auth", "token": "secret"}));
        assert_eq!(client.recv().await, json!({"type": "auth_response", "success": true}));
        client.send(json!({"type": "attach", "session_id": "s1"}));
        assert_eq!(client.recv().await["type"], "attach_response");

        let mut bad = Client::connect(&h.state, false);
        bad.send(json!({"type": "auth", "token": "wrong"}));
        assert_eq!(bad.recv().await, json!({"type": "auth_response", "success": false}));
        bad.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_messages() {
        let h = harness();
        let mut client = Client::connect(&h.state, true);
        client.send(json!({"type": "teleport"}));
        assert_eq!(
            client.recv().await,
            json!({"type": "error", "error": "Unknown message type"})
        );
        client.tx.unbounded_send("{nope".into()).unwrap();
        assert_eq!(
            client.recv().await,
            json!({"type": "error", "error": "Invalid message format"})
        );
        client.send(json!({"type": "attach"}));
        assert_eq!(client.recv().await["error"], "Invalid message format");
        assert!(!client.task.is_finished());
    }

    #[tokio::test]
    async fn test_message_starts_process_and_records_prompt() {
        let h = harness();
        let mut client = Client::connect(&h.state, true);
        client.send(json!({"type": "attach", "session_id": "s1"}));
        assert_eq!(
            client.recv().await,
            json!({"type": "attach_response", "session_id": "s1", "process_running": false})
        );

        client.send(json!({"type": "message", "session_id": "s1", "content": "hello"}));
        client.send(json!({"type": "attach", "session_id": "s1"}));
        assert_eq!(client.recv().await["process_running"], true);

        assert_eq!(*h.agent.inputs.lock().unwrap(), vec!["message:hello".to_string()]);
        let lines = h.store.lines.lock().unwrap();
        assert_eq!(
            lines[0],
            json!({"type": "message", "session_id": "s1", "content": "hello"})
        );
        assert!(h.state.processes.has_process("s1").await);
    }

    #[tokio::test]
    async fn test_events_reach_attached_viewers() {
        let h = harness();
        let mut a = Client::connect(&h.state, true);
        let mut b = Client::connect(&h.state, true);
        b.send(json!({"type": "attach", "session_id": "s1"}));
        assert_eq!(b.recv().await["type"], "attach_response");

        a.send(json!({"type": "message", "session_id": "s1", "content": "go"}));
        let tx = loop {
            if let Some(tx) = h.agent.senders.lock().unwrap().first().cloned() {
                break tx;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        tx.send(AgentEvent::text("working")).await.unwrap();

        let got_a = a.recv().await;
        let got_b = b.recv().await;
        assert_eq!(got_a, got_b);
        assert_eq!(got_a["session_id"], "s1");
        assert_eq!(got_a["content"], "working");
    }

    #[tokio::test]
    async fn test_controls_require_running_process() {
        let h = harness();
        let mut client = Client::connect(&h.state, true);
        client.send(json!({"type": "interrupt", "session_id": "ghost"}));
        let reply = client.recv().await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["session_id"], "ghost");

        client.send(json!({"type": "message", "session_id": "s1", "content": "hi"}));
        client.send(json!({"type": "interrupt", "session_id": "s1"}));
        client.send(json!({"type": "permission_response", "session_id": "s1", "request_id": "r1", "choice": "always_allow"}));
        client.send(json!({"type": "question_response", "session_id": "s1", "request_id": "q1"}));
        client.send(json!({"type": "attach", "session_id": "s1"}));
        assert_eq!(client.recv().await["type"], "attach_response");

        assert_eq!(
            *h.agent.inputs.lock().unwrap(),
            vec![
                "message:hi".to_string(),
                "interrupt".to_string(),
                "permission:r1:AlwaysAllow".to_string(),
                "question:q1:false".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_disconnect_removes_subscriptions_not_processes() {
        let h = harness();
        let mut client = Client::connect(&h.state, true);
        client.send(json!({"type": "message", "session_id": "s1", "content": "hi"}));
        client.send(json!({"type": "attach", "session_id": "s2"}));
        assert_eq!(client.recv().await["type"], "attach_response");
        assert_eq!(h.state.processes.subscriber_count("s1").await, 1);

        let Client { tx, task, .. } = client;
        drop(tx);
        task.await.unwrap();
        assert_eq!(h.state.processes.subscriber_count("s1").await, 0);
        assert_eq!(h.state.processes.subscriber_count("s2").await, 0);
        assert!(h.state.processes.has_process("s1").await);
    }

    #[tokio::test]
    async fn test_shutdown_ends_viewer_loop() {
        let h = harness();
        let client = Client::connect(&h.state, true);
        h.state.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), client.task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_virtual_stream_viewer_closes_stream_on_exit() {
        use crate::relay::frame::Frame;
        use crate::relay::stream::{lock_streams, Delivery, StreamMap, TunnelWriter};
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        use tokio_tungstenite::tungstenite;

        let h = harness();
        let (tx, mut rx) = fmpsc::unbounded::<tungstenite::Message>();
        let tunnel = TunnelWriter::new(tx.sink_map_err(|_| tungstenite::Error::ConnectionClosed));
        let streams = StreamMap::default();
        let stream = VirtualStream::open("v1", &streams, tunnel).unwrap();
        let task = tokio::spawn(serve_virtual_stream(h.state.clone(), stream));

        let auth = json!({"type": "auth", "token": "wrong"}).to_string();
        {
            let map = lock_streams(&streams);
            assert_eq!(map["v1"].deliver(Bytes::from_static(&[0xff, 0xfe])), Delivery::Queued);
            assert_eq!(map["v1"].deliver(Bytes::from(auth)), Delivery::Queued);
        }

        task.await.unwrap();

        let mut frames = Vec::new();
        while let Ok(Some(tungstenite::Message::Text(t))) = rx.try_next() {
            frames.push(Frame::decode(&t).unwrap());
        }
        assert_eq!(frames.len(), 2);
        let Frame::StreamData { stream_id, data } = &frames[0] else {
            panic!("expected stream_data, got {:?}", frames[0]);
        };
        assert_eq!(stream_id, "v1");
        let reply: Value = serde_json::from_slice(&STANDARD.decode(data).unwrap()).unwrap();
        assert_eq!(reply, json!({"type": "auth_response", "success": false}));
        assert_eq!(
            frames[1],
            Frame::StreamClose {
                stream_id: "v1".into()
            }
        );
        assert!(lock_streams(&streams).is_empty());
    }

    #[test]
    fn test_parse_rules() {
        assert!(matches!(
            parse(r#"{"type":"detach","session_id":"s"}"#),
            Ok(ClientMessage::Detach { .. })
        ));
        assert_eq!(parse("[]").unwrap_err(), "Invalid message format");
        assert_eq!(parse(r#"{"type":7}"#).unwrap_err(), "Invalid message format");
        assert_eq!(parse(r#"{"type":"x"}"#).unwrap_err(), "Unknown message type");
    }
}
