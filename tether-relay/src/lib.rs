//! Tether Relay Client
//!
//! Stateless HTTP helper for the approval relay. Every call carries the
//! bearer key and is bounded by a per-call timeout; a timed-out call is a
//! transport error, never a hang.

pub mod api;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod types;

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::json;
use tether_common::TetherConfig;
use tokio::time::timeout;
use tracing::debug;

pub use api::RelayApi;
#[cfg(any(test, feature = "test-utils"))]
pub use memory::{MemoryRelay, Op, Step};
pub use types::*;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay not configured")]
    NotConfigured,
    #[error("relay request timed out after {0:?}")]
    Timeout(Duration),
    #[error("relay transport error: {0}")]
    Transport(String),
    #[error("relay returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid relay response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RelayError::Decode(err.to_string())
        } else {
            RelayError::Transport(err.to_string())
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

const MAX_ERROR_BODY: usize = 512;

/// HTTP client for the relay API.
#[derive(Clone)]
pub struct RelayClient {
    base_url: String,
    http: Client,
    timeout: Duration,
}

impl RelayClient {
    pub fn new(base_url: &str, api_key: &str, call_timeout: Duration) -> RelayResult<Self> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
            .map_err(|_| RelayError::NotConfigured)?;
        headers.insert(AUTHORIZATION, bearer);

        let http = Client::builder()
            .default_headers(headers)
            .user_agent(concat!("tether/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RelayError::Transport(format!("http client error: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            timeout: call_timeout,
        })
    }

    /// Build from resolved configuration; `NotConfigured` when the relay
    /// endpoint or key is missing.
    pub fn from_config(config: &TetherConfig) -> RelayResult<Self> {
        match (&config.relay_url, &config.api_key) {
            (Some(url), Some(key)) => Self::new(url, key, config.request_timeout()),
            _ => Err(RelayError::NotConfigured),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn call_timeout(&self) -> Duration {
        self.timeout
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> RelayResult<reqwest::Response> {
        let response = timeout(self.timeout, request.send())
            .await
            .map_err(|_| RelayError::Timeout(self.timeout))??;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let mut body = timeout(self.timeout, response.text())
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(RelayError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> RelayResult<T> {
        let response = self.send(request).await?;
        let bytes = timeout(self.timeout, response.bytes())
            .await
            .map_err(|_| RelayError::Timeout(self.timeout))??;
        serde_json::from_slice(&bytes).map_err(|e| RelayError::Decode(e.to_string()))
    }

    async fn send_empty(&self, request: RequestBuilder) -> RelayResult<()> {
        self.send(request).await.map(|_| ())
    }

    pub async fn register_session(&self, session_id: &str, meta: &SessionMeta) -> RelayResult<()> {
        debug!(session_id, "registering session");
        let body = json!({ "session_id": session_id, "meta": meta });
        self.send_empty(self.http.post(self.url("/api/sessions/register")).json(&body))
            .await
    }

    pub async fn daemon_state(&self, session_id: &str) -> RelayResult<DaemonState> {
        let url = self.url(&format!("/api/sessions/{session_id}/daemon-state"));
        self.send_json(self.http.get(url)).await
    }

    pub async fn patch_daemon_state(
        &self,
        session_id: &str,
        patch: &DaemonStatePatch,
    ) -> RelayResult<()> {
        let url = self.url(&format!("/api/sessions/{session_id}/daemon-state"));
        self.send_empty(self.http.patch(url).json(patch)).await
    }

    pub async fn heartbeat(&self, session_id: &str, body: &HeartbeatBody) -> RelayResult<()> {
        let url = self.url(&format!("/api/sessions/{session_id}/heartbeat"));
        self.send_empty(self.http.post(url).json(body)).await
    }

    pub async fn create_approval(&self, approval: &NewApproval) -> RelayResult<String> {
        let created: CreatedApproval = self
            .send_json(self.http.post(self.url("/api/approvals")).json(approval))
            .await?;
        if created.id.is_empty() {
            return Err(RelayError::Decode("approval id missing".into()));
        }
        Ok(created.id)
    }

    pub async fn approval(&self, approval_id: &str) -> RelayResult<ApprovalRecord> {
        let url = self.url(&format!("/api/approvals/{approval_id}"));
        let mut record: ApprovalRecord = self.send_json(self.http.get(url)).await?;
        if record.id.is_empty() {
            record.id = approval_id.to_string();
        }
        Ok(record)
    }

    pub async fn ack_approval(&self, approval_id: &str) -> RelayResult<()> {
        let url = self.url(&format!("/api/approvals/{approval_id}/ack"));
        self.send_empty(self.http.post(url).json(&json!({ "processed": true })))
            .await
    }

    pub async fn invalidate_approvals(&self, session_id: &str, reason: &str) -> RelayResult<()> {
        let body = json!({ "session_id": session_id, "reason": reason });
        self.send_empty(self.http.post(self.url("/api/approvals/invalidate")).json(&body))
            .await
    }

    pub async fn list_approvals(
        &self,
        status: ApprovalStatus,
        session_id: &str,
    ) -> RelayResult<Vec<ApprovalRecord>> {
        let request = self
            .http
            .get(self.url("/api/approvals"))
            .query(&[("status", status.as_str()), ("session_id", session_id)]);
        let list: ApprovalList = self.send_json(request).await?;
        Ok(list.into_vec())
    }

    pub async fn mute_status(&self, session_id: &str) -> RelayResult<bool> {
        let url = self.url(&format!("/api/sessions/{session_id}/mute"));
        let status: MuteStatus = self.send_json(self.http.get(url)).await?;
        Ok(status.muted)
    }

    pub async fn notify(&self, session_id: &str, notification: &Notification) -> RelayResult<()> {
        let url = self.url(&format!("/api/sessions/{session_id}/notifications"));
        self.send_empty(self.http.post(url).json(notification)).await
    }
}
