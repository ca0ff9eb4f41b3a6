//! Wire types carried over the tunnel.
//!
//! Every tunnel message is one JSON text frame tagged by `type`:
//!
//! | Type            | Fields                                   | Direction     |
//! |-----------------|------------------------------------------|---------------|
//! | `http_request`  | `id`, `request {method,path,headers,body}` | relay → local |
//! | `http_response` | `id`, `response {status,headers,body}`   | local → relay |
//! | `stream_open`   | `stream_id`                              | relay → local |
//! | `stream_data`   | `stream_id`, `data` (base64)             | both          |
//! | `stream_close`  | `stream_id`                              | both          |
//!
//! Before any of these, the client performs a JSON-RPC 2.0 `register` call
//! (see [`RegisterRequest`] / [`RegisterResponse`]).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::RelayError;

/// Ceiling for one inbound tunnel message.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// Multi-valued header map, keyed by header name.
pub type Headers = HashMap<String, Vec<String>>;

/// Correlation id of an HTTP exchange, echoed verbatim on the response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExchangeId {
    Number(u64),
    Text(String),
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// A relayed HTTP request. `body` is base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
}

/// The local answer to an [`HttpRequest`]. `body` is base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    HttpRequest { id: ExchangeId, request: HttpRequest },
    HttpResponse { id: ExchangeId, response: HttpResponse },
    StreamOpen { stream_id: String },
    StreamData { stream_id: String, data: String },
    StreamClose { stream_id: String },
}

impl Frame {
    /// Parse one inbound text message, enforcing [`MAX_FRAME_BYTES`].
    pub fn decode(text: &str) -> Result<Self, RelayError> {
        if text.len() > MAX_FRAME_BYTES {
            return Err(RelayError::FrameTooLarge(text.len()));
        }
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// JSON-RPC `register` call sent once per tunnel connection.
#[derive(Debug, Serialize)]
pub struct RegisterRequest<'a> {
    jsonrpc: &'static str,
    method: &'static str,
    params: RegisterParams<'a>,
    id: u32,
}

#[derive(Debug, Serialize)]
struct RegisterParams<'a> {
    relay_token: &'a str,
}

impl<'a> RegisterRequest<'a> {
    pub fn new(relay_token: &'a str) -> Self {
        Self {
            jsonrpc: "2.0",
            method: "register",
            params: RegisterParams { relay_token },
            id: 1,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterResponse {
    #[serde(default)]
    result: Option<RegisterResult>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RegisterResult {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    message: String,
}

impl RegisterResponse {
    /// The reported status on success. An error reply, or a reply carrying
    /// neither result nor error, rejects the connection attempt.
    pub fn into_status(self) -> Result<String, RelayError> {
        match (self.result, self.error) {
            (_, Some(err)) => Err(RelayError::Rejected(err.message)),
            (Some(result), None) => Ok(result.status),
            (None, None) => Err(RelayError::Rejected("empty register reply".into())),
        }
    }
}
