use std::time::Duration;

use async_trait::async_trait;

use crate::types::{
    ApprovalRecord, ApprovalStatus, DaemonState, DaemonStatePatch, HeartbeatBody, NewApproval,
    Notification, SessionMeta,
};
use crate::{RelayClient, RelayError, RelayResult};

/// Relay operations consumed by the approval subsystem.
///
/// Components hold an `Arc<dyn RelayApi>` so the HTTP client and the
/// in-memory relay are interchangeable.
#[async_trait]
pub trait RelayApi: Send + Sync {
    async fn register_session(&self, session_id: &str, meta: &SessionMeta) -> RelayResult<()>;

    async fn daemon_state(&self, session_id: &str) -> RelayResult<DaemonState>;

    async fn patch_daemon_state(&self, session_id: &str, patch: &DaemonStatePatch)
        -> RelayResult<()>;

    async fn heartbeat(&self, session_id: &str, body: &HeartbeatBody) -> RelayResult<()>;

    /// Heartbeat bounded by `limit` instead of the client-wide timeout.
    async fn heartbeat_with_timeout(
        &self,
        session_id: &str,
        body: &HeartbeatBody,
        limit: Duration,
    ) -> RelayResult<()> {
        tokio::time::timeout(limit, self.heartbeat(session_id, body))
            .await
            .map_err(|_| RelayError::Timeout(limit))?
    }

    async fn create_approval(&self, approval: &NewApproval) -> RelayResult<String>;

    async fn approval(&self, approval_id: &str) -> RelayResult<ApprovalRecord>;

    async fn ack_approval(&self, approval_id: &str) -> RelayResult<()>;

    async fn invalidate_approvals(&self, session_id: &str, reason: &str) -> RelayResult<()>;

    async fn list_approvals(
        &self,
        status: ApprovalStatus,
        session_id: &str,
    ) -> RelayResult<Vec<ApprovalRecord>>;

    async fn mute_status(&self, session_id: &str) -> RelayResult<bool>;

    async fn notify(&self, session_id: &str, notification: &Notification) -> RelayResult<()>;
}

#[async_trait]
impl RelayApi for RelayClient {
    async fn register_session(&self, session_id: &str, meta: &SessionMeta) -> RelayResult<()> {
        RelayClient::register_session(self, session_id, meta).await
    }

    async fn daemon_state(&self, session_id: &str) -> RelayResult<DaemonState> {
        RelayClient::daemon_state(self, session_id).await
    }

    async fn patch_daemon_state(
        &self,
        session_id: &str,
        patch: &DaemonStatePatch,
    ) -> RelayResult<()> {
        RelayClient::patch_daemon_state(self, session_id, patch).await
    }

    async fn heartbeat(&self, session_id: &str, body: &HeartbeatBody) -> RelayResult<()> {
        RelayClient::heartbeat(self, session_id, body).await
    }

    async fn create_approval(&self, approval: &NewApproval) -> RelayResult<String> {
        RelayClient::create_approval(self, approval).await
    }

    async fn approval(&self, approval_id: &str) -> RelayResult<ApprovalRecord> {
        RelayClient::approval(self, approval_id).await
    }

    async fn ack_approval(&self, approval_id: &str) -> RelayResult<()> {
        RelayClient::ack_approval(self, approval_id).await
    }

    async fn invalidate_approvals(&self, session_id: &str, reason: &str) -> RelayResult<()> {
        RelayClient::invalidate_approvals(self, session_id, reason).await
    }

    async fn list_approvals(
        &self,
        status: ApprovalStatus,
        session_id: &str,
    ) -> RelayResult<Vec<ApprovalRecord>> {
        RelayClient::list_approvals(self, status, session_id).await
    }

    async fn mute_status(&self, session_id: &str) -> RelayResult<bool> {
        RelayClient::mute_status(self, session_id).await
    }

    async fn notify(&self, session_id: &str, notification: &Notification) -> RelayResult<()> {
        RelayClient::notify(self, session_id, notification).await
    }
}
