//! Control-plane HTTP client: register, refresh, announcement.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::store::RegistrationRecord;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ANNOUNCEMENT_TIMEOUT: Duration = Duration::from_secs(3);

/// Typed failures from the control plane.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("relay token rejected by the control plane")]
    InvalidToken,
    #[error("client version too old, please upgrade pockode")]
    UpgradeRequired,
    #[error("unexpected status from control plane: {0}")]
    UnexpectedStatus(u16),
    #[error("control plane request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Deserialize)]
struct Announcement {
    #[serde(default)]
    message: String,
}

/// Stateless client; every call is one request.
#[derive(Debug, Clone)]
pub struct RegistrationClient {
    base_url: String,
    client_version: String,
    http: reqwest::Client,
}

impl RegistrationClient {
    pub fn new(base_url: &str, client_version: &str) -> Result<Self, RegistrationError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client_version: client_version.to_string(),
            http,
        })
    }

    /// Obtain a brand-new registration.
    pub async fn register(&self) -> Result<RegistrationRecord, RegistrationError> {
        let resp = self
            .http
            .post(format!("{}/api/relay/register", self.base_url))
            .json(&json!({ "client_version": self.client_version }))
            .send()
            .await?;

        match resp.status() {
            StatusCode::CREATED => Ok(resp.json().await?),
            StatusCode::FORBIDDEN => Err(RegistrationError::UpgradeRequired),
            status => Err(RegistrationError::UnexpectedStatus(status.as_u16())),
        }
    }

    /// Exchange a stored token for a current record.
    pub async fn refresh(&self, relay_token: &str) -> Result<RegistrationRecord, RegistrationError> {
        let resp = self
            .http
            .post(format!("{}/api/relay/refresh", self.base_url))
            .json(&json!({
                "relay_token": relay_token,
                "client_version": self.client_version,
            }))
            .send()
            .await?;

        match resp.status() {
            StatusCode::OK => Ok(resp.json().await?),
            StatusCode::UNAUTHORIZED => Err(RegistrationError::InvalidToken),
            StatusCode::FORBIDDEN => Err(RegistrationError::UpgradeRequired),
            status => Err(RegistrationError::UnexpectedStatus(status.as_u16())),
        }
    }

    /// Operator announcement, or an empty string on any failure.
    pub async fn announcement(&self) -> String {
        let result = async {
            let resp = self
                .http
                .get(format!("{}/api/announcement", self.base_url))
                .timeout(ANNOUNCEMENT_TIMEOUT)
                .send()
                .await?
                .error_for_status()?;
            resp.json::<Announcement>().await
        }
        .await;

        match result {
            Ok(a) => a.message,
            Err(e) => {
                debug!("announcement unavailable: {e}");
                String::new()
            }
        }
    }
}
