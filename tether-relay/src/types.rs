use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of an approval record. Only `Pending` is non-terminal.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    #[serde(alias = "approved")]
    Allowed,
    #[serde(alias = "rejected")]
    Denied,
    Invalidated,
    Expired,
    /// Anything the relay reports that this client does not know yet.
    #[serde(other)]
    Unknown,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ApprovalStatus::Allowed
                | ApprovalStatus::Denied
                | ApprovalStatus::Invalidated
                | ApprovalStatus::Expired
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Allowed => "allowed",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Invalidated => "invalidated",
            ApprovalStatus::Expired => "expired",
            ApprovalStatus::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionLocation {
    Local,
    Remote,
    DaemonHandoff,
    None,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DaemonStatus {
    #[default]
    Idle,
    Running,
    Stopped,
}

/// Per-session record read by the presence oracle.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DaemonState {
    #[serde(default)]
    pub is_away: bool,
    #[serde(default)]
    pub status: DaemonStatus,
    #[serde(default)]
    pub started_reason: Option<String>,
    #[serde(default)]
    pub stopped_reason: Option<String>,
    #[serde(default)]
    pub last_approval_location: Option<DecisionLocation>,
}

impl DaemonState {
    /// Merge a partial update the way the relay does server-side.
    pub fn apply(&mut self, patch: &DaemonStatePatch) {
        if let Some(away) = patch.is_away {
            self.is_away = away;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(reason) = &patch.started_reason {
            self.started_reason = Some(reason.clone());
        }
        if let Some(reason) = &patch.stopped_reason {
            self.stopped_reason = Some(reason.clone());
        }
        if let Some(location) = patch.last_approval_location {
            self.last_approval_location = Some(location);
        }
    }
}

/// Partial update for `PATCH /api/sessions/{id}/daemon-state`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DaemonStatePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_away: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DaemonStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_approval_location: Option<DecisionLocation>,
}

impl DaemonStatePatch {
    pub fn away() -> Self {
        Self {
            is_away: Some(true),
            ..Default::default()
        }
    }

    pub fn running(started_reason: &str) -> Self {
        Self {
            status: Some(DaemonStatus::Running),
            started_reason: Some(started_reason.to_string()),
            last_approval_location: Some(DecisionLocation::DaemonHandoff),
            ..Default::default()
        }
    }

    pub fn stopped(stopped_reason: &str, location: Option<DecisionLocation>) -> Self {
        Self {
            status: Some(DaemonStatus::Stopped),
            stopped_reason: Some(stopped_reason.to_string()),
            last_approval_location: location,
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewApproval {
    pub session_id: String,
    pub tool_name: String,
    pub tool_input: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreatedApproval {
    pub id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    pub status: ApprovalStatus,
    #[serde(default)]
    pub decision_location: Option<DecisionLocation>,
    #[serde(default)]
    pub decision_reason: Option<String>,
    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatBody {
    pub timestamp: DateTime<Utc>,
    pub pid: u32,
    pub count: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionMeta {
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

impl SessionMeta {
    pub fn current(cwd: Option<String>) -> Self {
        Self {
            cwd,
            hostname: hostname::get()
                .ok()
                .map(|h| h.to_string_lossy().to_string()),
            pid: std::process::id(),
            started_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct MuteStatus {
    #[serde(default)]
    pub muted: bool,
}

/// `GET /api/approvals` answers either a bare array or `{ "approvals": [...] }`.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum ApprovalList {
    Bare(Vec<ApprovalRecord>),
    Wrapped { approvals: Vec<ApprovalRecord> },
}

impl ApprovalList {
    pub fn into_vec(self) -> Vec<ApprovalRecord> {
        match self {
            ApprovalList::Bare(list) => list,
            ApprovalList::Wrapped { approvals } => approvals,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_aliases_and_unknowns() {
        let s: ApprovalStatus = serde_json::from_str("\"approved\"").unwrap();
        assert_eq!(s, ApprovalStatus::Allowed);
        let s: ApprovalStatus = serde_json::from_str("\"escalated\"").unwrap();
        assert_eq!(s, ApprovalStatus::Unknown);
        assert!(!s.is_terminal());
        assert!(ApprovalStatus::Expired.is_terminal());
    }

    #[test]
    fn patch_skips_unset_fields() {
        let body = serde_json::to_value(DaemonStatePatch::away()).unwrap();
        assert_eq!(body, serde_json::json!({ "is_away": true }));

        let body = serde_json::to_value(DaemonStatePatch::running("timeout")).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "status": "running",
                "started_reason": "timeout",
                "last_approval_location": "daemon_handoff"
            })
        );
    }

    #[test]
    fn daemon_state_tolerates_sparse_payloads() {
        let state: DaemonState = serde_json::from_str(r#"{"is_away": true}"#).unwrap();
        assert!(state.is_away);
        assert_eq!(state.status, DaemonStatus::Idle);

        let mut state = DaemonState::default();
        state.apply(&DaemonStatePatch::stopped(
            "local_approval",
            Some(DecisionLocation::Local),
        ));
        assert_eq!(state.status, DaemonStatus::Stopped);
        assert_eq!(state.stopped_reason.as_deref(), Some("local_approval"));
        assert_eq!(state.last_approval_location, Some(DecisionLocation::Local));
    }

    #[test]
    fn approval_list_accepts_both_shapes() {
        let bare: ApprovalList =
            serde_json::from_str(r#"[{"id":"a","status":"allowed"}]"#).unwrap();
        assert_eq!(bare.into_vec().len(), 1);
        let wrapped: ApprovalList =
            serde_json::from_str(r#"{"approvals":[{"id":"a","status":"allowed"},{"id":"b","status":"pending"}]}"#)
                .unwrap();
        assert_eq!(wrapped.into_vec().len(), 2);
    }
}
