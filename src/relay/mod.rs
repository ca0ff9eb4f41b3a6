//! Tunnel relay: public reachability through one outbound connection.
//!
//! The [`RelayManager`] registers this server with the cloud control plane,
//! keeps a single WebSocket tunnel to the assigned relay host alive, and runs
//! a [`Multiplexer`] over it. Two kinds of traffic share the tunnel:
//!
//! - **HTTP exchanges**: one relayed request, one correlated response, served
//!   by the [`HttpProxy`] against the local backend or frontend port.
//! - **Virtual streams**: long-lived byte channels (forwarded WebSocket
//!   connections) handed to the local WebSocket endpoint.
//!
//! ## Submodules
//!
//! | Module     | Role                                                  |
//! |------------|-------------------------------------------------------|
//! | `store`    | Registration record on disk (`relay.json`)            |
//! | `client`   | Control-plane register / refresh / announcement calls |
//! | `frame`    | Tunnel frame and handshake wire types                 |
//! | `stream`   | Virtual streams and the serialized tunnel writer      |
//! | `mux`      | Frame demultiplexer for one tunnel connection         |
//! | `http`     | Loopback HTTP proxy for relayed requests              |
//! | `backoff`  | Reconnect delay policy                                |
//! | `manager`  | Start / stop and the supervised reconnect loop        |

pub mod backoff;
pub mod client;
pub mod frame;
pub mod http;
pub mod manager;
pub mod mux;
pub mod store;
pub mod stream;

use tokio_tungstenite::tungstenite;

pub use client::{RegistrationClient, RegistrationError};
pub use http::HttpProxy;
pub use manager::RelayManager;
pub use mux::{Multiplexer, RequestHandler};
pub use store::{ConfigStore, RegistrationRecord};
pub use stream::VirtualStream;

/// Why a relay operation or tunnel connection ended.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay config store: {0}")]
    Store(#[from] std::io::Error),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error("failed to dial relay: {0}")]
    Dial(Box<tungstenite::Error>),
    #[error("tunnel transport error: {0}")]
    WebSocket(Box<tungstenite::Error>),
    #[error("relay rejected registration: {0}")]
    Rejected(String),
    #[error("undecodable frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds the size limit")]
    FrameTooLarge(usize),
    #[error("timed out connecting to relay")]
    Timeout,
    #[error("tunnel connection closed")]
    ConnectionClosed,
    #[error("cancelled")]
    Cancelled,
}

impl From<tungstenite::Error> for RelayError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Self::ConnectionClosed
            }
            other => Self::WebSocket(Box::new(other)),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::net::SocketAddr;

    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    /// Serve `app` on an ephemeral loopback port.
    pub async fn serve_loopback(app: axum::Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    /// In-memory tunnel: (local side, relay side).
    pub async fn tunnel_pair() -> (
        WebSocketStream<DuplexStream>,
        WebSocketStream<DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(1 << 20);
        let local = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let relay = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (local, relay)
    }
}
