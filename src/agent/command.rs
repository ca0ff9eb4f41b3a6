//! Agent backed by an external command speaking JSON lines.
//!
//! The command is started as `<command> <args…> --session-id <id> [--resume]`
//! in the configured working directory. Every stdout line is one
//! [`AgentEvent`] object; viewer actions are written to stdin as one JSON
//! object per line (`message`, `interrupt`, `permission_response`,
//! `question_response`). Stderr is forwarded to the log.
//!
//! The child is spawned with `kill_on_drop(true)` and is killed when either
//! the session is closed or the manager's cancellation token fires.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Agent, AgentError, AgentEvent, AgentProcess, AgentSession, PermissionChoice};

/// Buffered events per process before the reader applies back-pressure.
const EVENT_BUFFER: usize = 256;

/// Launches one child process per session.
pub struct CommandAgent {
    command: String,
    args: Vec<String>,
}

impl CommandAgent {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

/// One line written to the child's stdin.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AgentInput<'a> {
    Message {
        content: &'a str,
    },
    Interrupt,
    PermissionResponse {
        request_id: &'a str,
        choice: PermissionChoice,
    },
    QuestionResponse {
        request_id: &'a str,
        answers: Option<HashMap<String, String>>,
    },
}

struct CommandSession {
    session_id: String,
    stdin: Mutex<Option<ChildStdin>>,
    stop: CancellationToken,
}

impl CommandSession {
    async fn write(&self, input: &AgentInput<'_>) -> Result<(), AgentError> {
        let mut line = serde_json::to_vec(input)?;
        line.push(b'\n');
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(AgentError::NotRunning)?;
        if let Err(e) = stdin.write_all(&line).await {
            // Broken pipe: the child is gone, later writes fail fast.
            guard.take();
            return Err(e.into());
        }
        stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl AgentSession for CommandSession {
    async fn send_message(&self, content: &str) -> Result<(), AgentError> {
        self.write(&AgentInput::Message { content }).await
    }

    async fn send_interrupt(&self) -> Result<(), AgentError> {
        self.write(&AgentInput::Interrupt).await
    }

    async fn send_permission_response(
        &self,
        request_id: &str,
        choice: PermissionChoice,
    ) -> Result<(), AgentError> {
        self.write(&AgentInput::PermissionResponse { request_id, choice })
            .await
    }

    async fn send_question_response(
        &self,
        request_id: &str,
        answers: Option<HashMap<String, String>>,
    ) -> Result<(), AgentError> {
        self.write(&AgentInput::QuestionResponse {
            request_id,
            answers,
        })
        .await
    }

    async fn close(&self) {
        self.stdin.lock().await.take();
        self.stop.cancel();
        debug!(session_id = %self.session_id, "agent session close requested");
    }
}

#[async_trait]
impl Agent for CommandAgent {
    async fn start(
        &self,
        cancel: CancellationToken,
        work_dir: &Path,
        session_id: &str,
        resume: bool,
    ) -> Result<AgentProcess, AgentError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .arg("--session-id")
            .arg(session_id)
            .current_dir(work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if resume {
            cmd.arg("--resume");
        }
        let mut child = cmd.spawn()?;
        let pid = child.id();

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or(AgentError::NotRunning)?;
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let stop = cancel.child_token();

        let sid = session_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match serde_json::from_str::<AgentEvent>(&line) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(session_id = %sid, "skipping unparseable agent output: {e}"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!(session_id = %sid, "agent stdout read failed: {e}");
                        break;
                    }
                }
            }
        });

        if let Some(stderr) = stderr {
            let sid = session_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(session_id = %sid, stderr = %line, "agent stderr");
                }
            });
        }

        let watch = stop.clone();
        let sid = session_id.to_string();
        tokio::spawn(async move {
            let stopped = tokio::select! {
                status = child.wait() => {
                    info!(session_id = %sid, ?status, "agent process exited");
                    false
                }
                () = watch.cancelled() => true,
            };
            if stopped {
                if let Err(e) = child.kill().await {
                    warn!(session_id = %sid, "failed to kill agent process: {e}");
                }
                info!(session_id = %sid, "agent process killed");
            }
        });

        info!(session_id, ?pid, resume, "agent process started");
        Ok(AgentProcess {
            session: Arc::new(CommandSession {
                session_id: session_id.to_string(),
                stdin: Mutex::new(stdin),
                stop,
            }),
            events: rx,
        })
    }
}
