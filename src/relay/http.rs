//! Loopback HTTP proxy for relayed requests.
//!
//! Requests for `/api…`, `/health` and `/ws` go to the backend port, the rest
//! to the frontend (dev asset) port, both on `localhost`. Any failure becomes
//! a synthesized `502 bad gateway` so the multiplexer always has a response.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::{Method, Request};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tracing::warn;

use super::frame::{Headers, HttpRequest, HttpResponse};
use super::mux::RequestHandler;

/// Largest backend response relayed; its base64 frame stays under the
/// tunnel's frame ceiling.
pub const MAX_BODY_BYTES: usize = 7 * 1024 * 1024;

const PROXY_TIMEOUT: Duration = Duration::from_secs(10);

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Whether `path` belongs to the backend rather than the frontend.
pub fn is_backend_path(path: &str) -> bool {
    path.starts_with("/api") || path == "/health" || path == "/ws"
}

#[derive(Debug, thiserror::Error)]
enum ProxyError {
    #[error("invalid request body encoding: {0}")]
    Body(#[from] base64::DecodeError),
    #[error("path must be absolute: {0:?}")]
    Path(String),
    #[error("invalid method: {0}")]
    Method(#[from] hyper::http::method::InvalidMethod),
    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),
    #[error("backend unreachable: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),
    #[error("reading backend response: {0}")]
    Response(Box<dyn std::error::Error + Send + Sync>),
    #[error("timed out")]
    Timeout,
}

pub struct HttpProxy {
    backend_port: u16,
    frontend_port: u16,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpProxy {
    pub fn new(backend_port: u16, frontend_port: u16) -> Self {
        Self {
            backend_port,
            frontend_port,
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    fn target_port(&self, path: &str) -> u16 {
        if is_backend_path(path) {
            self.backend_port
        } else {
            self.frontend_port
        }
    }

    async fn forward(&self, req: HttpRequest) -> Result<HttpResponse, ProxyError> {
        if !req.path.starts_with('/') {
            return Err(ProxyError::Path(req.path));
        }
        let body = if req.body.is_empty() {
            Bytes::new()
        } else {
            Bytes::from(STANDARD.decode(req.body.as_bytes())?)
        };

        let uri = format!("http://localhost:{}{}", self.target_port(&req.path), req.path);
        let mut builder = Request::builder()
            .method(Method::from_bytes(req.method.as_bytes())?)
            .uri(uri);
        for (name, values) in &req.headers {
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case("host") {
                continue;
            }
            for value in values {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        let request = builder.body(Full::new(body))?;

        let response = self.client.request(request).await?;
        let (parts, body) = response.into_parts();
        let body = Limited::new(body, MAX_BODY_BYTES)
            .collect()
            .await
            .map_err(ProxyError::Response)?
            .to_bytes();

        let mut headers = Headers::new();
        for (name, value) in &parts.headers {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        Ok(HttpResponse {
            status: parts.status.as_u16(),
            headers,
            body: STANDARD.encode(&body),
        })
    }
}

impl RequestHandler for HttpProxy {
    async fn handle(&self, request: HttpRequest) -> HttpResponse {
        let path = request.path.clone();
        let result = match tokio::time::timeout(PROXY_TIMEOUT, self.forward(request)).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::Timeout),
        };
        result.unwrap_or_else(|e| {
            warn!(path = %path, "relayed request failed: {e}");
            bad_gateway()
        })
    }
}

fn bad_gateway() -> HttpResponse {
    HttpResponse {
        status: 502,
        headers: Headers::from([("Content-Type".to_string(), vec!["text/plain".to_string()])]),
        body: STANDARD.encode("bad gateway"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::testing::serve_loopback;
    use axum::{
        http::{HeaderMap, StatusCode},
        response::IntoResponse,
        routing::{get, post},
        Router,
    };

    fn get_request(path: &str) -> HttpRequest {
        HttpRequest {
            method: "GET".into(),
            path: path.into(),
            headers: Headers::new(),
            body: String::new(),
        }
    }

    fn assert_bad_gateway(resp: &HttpResponse) {
        assert_eq!(resp.status, 502);
        assert_eq!(resp.headers["Content-Type"], vec!["text/plain"]);
        assert_eq!(STANDARD.decode(&resp.body).unwrap(), b"bad gateway");
    }

    fn body(resp: &HttpResponse) -> String {
        String::from_utf8(STANDARD.decode(&resp.body).unwrap()).unwrap()
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn backend() -> u16 {
        let app = Router::new()
            .route(
                "/api/echo",
                post(|headers: HeaderMap, body: String| async move {
                    let saw_proxy_auth = headers.contains_key("proxy-authorization");
                    let custom = headers
                        .get("x-req")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    (
                        StatusCode::CREATED,
                        [("x-custom", "1"), ("proxy-authenticate", "Basic")],
                        format!("{body}|{custom}|{saw_proxy_auth}"),
                    )
                        .into_response()
                }),
            )
            .route("/health", get(|| async { "back" }))
            .route("/api/huge", get(|| async { vec![b'a'; MAX_BODY_BYTES + 1] }));
        serve_loopback(app).await.port()
    }

    async fn frontend() -> u16 {
        let app = Router::new().fallback(|| async { "front" });
        serve_loopback(app).await.port()
    }

    #[test]
    fn test_backend_routing_rule() {
        assert!(is_backend_path("/api"));
        assert!(is_backend_path("/api/sessions?x=1"));
        assert!(is_backend_path("/health"));
        assert!(is_backend_path("/ws"));
        assert!(!is_backend_path("/ws/other"));
        assert!(!is_backend_path("/healthz"));
        assert!(!is_backend_path("/"));
        assert!(!is_backend_path("/assets/app.js"));
    }

    #[test]
    fn test_hop_by_hop_case_insensitive() {
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("TE"));
        assert!(is_hop_by_hop("keep-alive"));
        assert!(!is_hop_by_hop("Content-Type"));
    }

    #[tokio::test]
    async fn test_undecodable_body_is_bad_gateway() {
        let proxy = HttpProxy::new(free_port(), free_port());
        let resp = proxy
            .handle(HttpRequest {
                method: "POST".into(),
                path: "/api/x".into(),
                headers: Headers::new(),
                body: "!!not base64!!".into(),
            })
            .await;
        assert_bad_gateway(&resp);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_bad_gateway() {
        let proxy = HttpProxy::new(free_port(), free_port());
        assert_bad_gateway(&proxy.handle(get_request("/api/x")).await);
        assert_bad_gateway(&proxy.handle(get_request("index.html")).await);
    }

    #[tokio::test]
    async fn test_routes_between_backend_and_frontend() {
        let proxy = HttpProxy::new(backend().await, frontend().await);
        let resp = proxy.handle(get_request("/health")).await;
        assert_eq!(resp.status, 200);
        assert_eq!(body(&resp), "back");

        let resp = proxy.handle(get_request("/index.html")).await;
        assert_eq!(body(&resp), "front");
    }

    #[tokio::test]
    async fn test_forwards_body_and_strips_hop_by_hop() {
        let proxy = HttpProxy::new(backend().await, frontend().await);
        let headers = Headers::from([
            ("X-Req".to_string(), vec!["yes".to_string()]),
            ("Proxy-Authorization".to_string(), vec!["secret".to_string()]),
            ("Host".to_string(), vec!["abc.relay.example".to_string()]),
        ]);
        let resp = proxy
            .handle(HttpRequest {
                method: "POST".into(),
                path: "/api/echo".into(),
                headers,
                body: STANDARD.encode("payload"),
            })
            .await;

        assert_eq!(resp.status, 201);
        assert_eq!(body(&resp), "payload|yes|false");
        assert_eq!(resp.headers["x-custom"], vec!["1"]);
        assert!(!resp.headers.contains_key("proxy-authenticate"));
    }

    #[tokio::test]
    async fn test_oversized_response_is_bad_gateway() {
        let proxy = HttpProxy::new(backend().await, frontend().await);
        assert_bad_gateway(&proxy.handle(get_request("/api/huge")).await);
    }
}
