//! Agent collaborator: starts conversation processes and carries their events.
//!
//! An [`Agent`] starts one [`AgentProcess`] per session. The process is split
//! into a shared control handle ([`AgentSession`]) and a single-consumer event
//! receiver, which the process manager's drain task owns for the process's
//! whole life. The receiver closing means the process has ended.

pub mod command;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use command::CommandAgent;

/// Errors surfaced by agent implementations.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to start agent process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("agent process is not running")]
    NotRunning,
    #[error("failed to encode agent input: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Kind of event emitted by a conversation process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Text,
    ToolCall,
    ToolResult,
    Error,
    Done,
    Interrupted,
    PermissionRequest,
    AskUserQuestion,
    System,
}

/// One event from a conversation process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_use_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_result: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permission_suggestions: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<Value>,
}

impl AgentEvent {
    /// A bare event of `kind` with every optional field empty.
    pub fn new(kind: EventType) -> Self {
        Self {
            kind,
            content: String::new(),
            tool_name: String::new(),
            tool_input: None,
            tool_use_id: String::new(),
            tool_result: String::new(),
            error: String::new(),
            request_id: String::new(),
            permission_suggestions: Vec::new(),
            questions: Vec::new(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::new(EventType::Text)
        }
    }
}

/// Viewer's answer to a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionChoice {
    Deny,
    Allow,
    AlwaysAllow,
}

impl PermissionChoice {
    /// Anything unrecognised is treated as a denial.
    pub fn parse(choice: &str) -> Self {
        match choice {
            "allow" => Self::Allow,
            "always_allow" => Self::AlwaysAllow,
            _ => Self::Deny,
        }
    }
}

/// Control handle of a running conversation process.
#[async_trait]
pub trait AgentSession: Send + Sync {
    async fn send_message(&self, content: &str) -> Result<(), AgentError>;
    /// Soft stop of the current turn; the process keeps running.
    async fn send_interrupt(&self) -> Result<(), AgentError>;
    async fn send_permission_response(
        &self,
        request_id: &str,
        choice: PermissionChoice,
    ) -> Result<(), AgentError>;
    /// `answers = None` cancels the question.
    async fn send_question_response(
        &self,
        request_id: &str,
        answers: Option<HashMap<String, String>>,
    ) -> Result<(), AgentError>;
    /// Terminate the process. The event receiver closes afterwards.
    async fn close(&self);
}

/// A freshly started process: control handle plus its event sequence.
pub struct AgentProcess {
    pub session: Arc<dyn AgentSession>,
    pub events: mpsc::Receiver<AgentEvent>,
}

/// Starts conversation processes.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Start a process for `session_id`. The process must stop when `cancel`
    /// fires, independently of the caller's lifetime.
    async fn start(
        &self,
        cancel: CancellationToken,
        work_dir: &Path,
        session_id: &str,
        resume: bool,
    ) -> Result<AgentProcess, AgentError>;
}
