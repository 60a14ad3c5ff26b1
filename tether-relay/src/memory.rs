//! In-memory relay for tests.
//!
//! Mirrors the relay's server-side semantics closely enough to drive the
//! approval state machine: monotonic approval status, merge-on-PATCH daemon
//! state, idempotent invalidation. Every call is counted per [`Op`] and can
//! be made to fail or stall.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::api::RelayApi;
use crate::types::{
    ApprovalRecord, ApprovalStatus, DaemonState, DaemonStatePatch, DecisionLocation,
    HeartbeatBody, NewApproval, Notification, SessionMeta,
};
use crate::{RelayError, RelayResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Register,
    DaemonState,
    PatchDaemonState,
    Heartbeat,
    CreateApproval,
    Approval,
    Ack,
    Invalidate,
    ListApprovals,
    Mute,
    Notify,
}

/// One scripted answer to `GET /api/approvals/{id}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Status(ApprovalStatus),
    Fail,
}

#[derive(Default)]
struct FailPlan {
    next: usize,
    always: bool,
    nth: HashSet<usize>,
}

#[derive(Default)]
struct SessionEntry {
    meta: Option<SessionMeta>,
    daemon: DaemonState,
    patches: Vec<DaemonStatePatch>,
    heartbeats: Vec<HeartbeatBody>,
    muted: bool,
    notifications: Vec<Notification>,
}

#[derive(Default)]
struct State {
    sessions: HashMap<String, SessionEntry>,
    approvals: Vec<ApprovalRecord>,
    scripts: HashMap<String, VecDeque<Step>>,
    next_script: Option<VecDeque<Step>>,
    failures: HashMap<Op, FailPlan>,
    latency: HashMap<Op, Duration>,
    calls: Vec<Op>,
    invalidations: Vec<(String, String)>,
    acked: Vec<String>,
    next_id: u64,
    assigned_ids: VecDeque<String>,
}

#[derive(Default)]
pub struct MemoryRelay {
    state: Mutex<State>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // --- scripting -------------------------------------------------------

    pub fn set_away(&self, session_id: &str, away: bool) {
        self.lock()
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .daemon
            .is_away = away;
    }

    pub fn set_muted(&self, session_id: &str, muted: bool) {
        self.lock()
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .muted = muted;
    }

    /// Answers for the next approval created, consumed one per poll. Once
    /// exhausted, polls report the stored status.
    pub fn script_next_approval(&self, steps: Vec<Step>) {
        self.lock().next_script = Some(steps.into());
    }

    /// Id handed out by the next `create_approval` instead of `apr-N`.
    pub fn assign_next_id(&self, id: &str) {
        self.lock().assigned_ids.push_back(id.to_string());
    }

    /// Insert an existing record, e.g. one decided while nobody was polling.
    pub fn insert_approval(&self, record: ApprovalRecord) {
        self.lock().approvals.push(record);
    }

    /// Set the status of an approval as a remote approver would.
    pub fn decide(&self, approval_id: &str, status: ApprovalStatus) {
        let mut state = self.lock();
        if let Some(record) = state.approvals.iter_mut().find(|a| a.id == approval_id) {
            if !record.status.is_terminal() {
                record.status = status;
                record.decision_location = Some(DecisionLocation::Remote);
            }
        }
    }

    pub fn fail_next(&self, op: Op, times: usize) {
        self.lock().failures.entry(op).or_default().next = times;
    }

    pub fn fail_always(&self, op: Op) {
        self.lock().failures.entry(op).or_default().always = true;
    }

    /// Fail only the `n`-th call (1-based) of `op`.
    pub fn fail_on_call(&self, op: Op, n: usize) {
        self.lock().failures.entry(op).or_default().nth.insert(n);
    }

    pub fn recover(&self, op: Op) {
        self.lock().failures.remove(&op);
    }

    pub fn set_latency(&self, op: Op, latency: Duration) {
        self.lock().latency.insert(op, latency);
    }

    // --- inspection ------------------------------------------------------

    pub fn calls(&self, op: Op) -> usize {
        self.lock().calls.iter().filter(|c| **c == op).count()
    }

    pub fn call_log(&self) -> Vec<Op> {
        self.lock().calls.clone()
    }

    pub fn approvals(&self) -> Vec<ApprovalRecord> {
        self.lock().approvals.clone()
    }

    pub fn status_of(&self, approval_id: &str) -> Option<ApprovalStatus> {
        self.lock()
            .approvals
            .iter()
            .find(|a| a.id == approval_id)
            .map(|a| a.status)
    }

    pub fn daemon_state_of(&self, session_id: &str) -> DaemonState {
        self.lock()
            .sessions
            .get(session_id)
            .map(|s| s.daemon.clone())
            .unwrap_or_default()
    }

    pub fn patches(&self, session_id: &str) -> Vec<DaemonStatePatch> {
        self.lock()
            .sessions
            .get(session_id)
            .map(|s| s.patches.clone())
            .unwrap_or_default()
    }

    pub fn heartbeats(&self, session_id: &str) -> Vec<HeartbeatBody> {
        self.lock()
            .sessions
            .get(session_id)
            .map(|s| s.heartbeats.clone())
            .unwrap_or_default()
    }

    pub fn registered(&self, session_id: &str) -> Option<SessionMeta> {
        self.lock()
            .sessions
            .get(session_id)
            .and_then(|s| s.meta.clone())
    }

    pub fn notifications(&self, session_id: &str) -> Vec<Notification> {
        self.lock()
            .sessions
            .get(session_id)
            .map(|s| s.notifications.clone())
            .unwrap_or_default()
    }

    pub fn invalidations(&self) -> Vec<(String, String)> {
        self.lock().invalidations.clone()
    }

    pub fn acked(&self) -> Vec<String> {
        self.lock().acked.clone()
    }

    // --- plumbing --------------------------------------------------------

    /// Count the call, apply latency, then decide whether it fails.
    async fn enter(&self, op: Op) -> RelayResult<()> {
        let latency = {
            let mut state = self.lock();
            state.calls.push(op);
            state.latency.get(&op).copied()
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        let nth = state.calls.iter().filter(|c| **c == op).count();
        let Some(plan) = state.failures.get_mut(&op) else {
            return Ok(());
        };
        let fail = if plan.always || plan.nth.contains(&nth) {
            true
        } else if plan.next > 0 {
            plan.next -= 1;
            true
        } else {
            false
        };
        if fail {
            Err(RelayError::Transport(format!("injected failure: {op:?}")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RelayApi for MemoryRelay {
    async fn register_session(&self, session_id: &str, meta: &SessionMeta) -> RelayResult<()> {
        self.enter(Op::Register).await?;
        self.lock()
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .meta = Some(meta.clone());
        Ok(())
    }

    async fn daemon_state(&self, session_id: &str) -> RelayResult<DaemonState> {
        self.enter(Op::DaemonState).await?;
        Ok(self.daemon_state_of(session_id))
    }

    async fn patch_daemon_state(
        &self,
        session_id: &str,
        patch: &DaemonStatePatch,
    ) -> RelayResult<()> {
        self.enter(Op::PatchDaemonState).await?;
        let mut state = self.lock();
        let entry = state.sessions.entry(session_id.to_string()).or_default();
        entry.daemon.apply(patch);
        entry.patches.push(patch.clone());
        Ok(())
    }

    async fn heartbeat(&self, session_id: &str, body: &HeartbeatBody) -> RelayResult<()> {
        self.enter(Op::Heartbeat).await?;
        self.lock()
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .heartbeats
            .push(body.clone());
        Ok(())
    }

    async fn create_approval(&self, approval: &NewApproval) -> RelayResult<String> {
        self.enter(Op::CreateApproval).await?;
        let mut state = self.lock();
        state.next_id += 1;
        let id = match state.assigned_ids.pop_front() {
            Some(id) => id,
            None => format!("apr-{}", state.next_id),
        };
        state.approvals.push(ApprovalRecord {
            id: id.clone(),
            session_id: Some(approval.session_id.clone()),
            tool_name: Some(approval.tool_name.clone()),
            tool_input: Some(approval.tool_input.clone()),
            status: ApprovalStatus::Pending,
            decision_location: None,
            decision_reason: None,
            processed: false,
            created_at: Some(Utc::now()),
        });
        if let Some(script) = state.next_script.take() {
            state.scripts.insert(id.clone(), script);
        }
        Ok(id)
    }

    async fn approval(&self, approval_id: &str) -> RelayResult<ApprovalRecord> {
        self.enter(Op::Approval).await?;
        let mut state = self.lock();
        let step = state
            .scripts
            .get_mut(approval_id)
            .and_then(|steps| steps.pop_front());
        if step == Some(Step::Fail) {
            return Err(RelayError::Transport("scripted poll failure".into()));
        }
        let record = state
            .approvals
            .iter_mut()
            .find(|a| a.id == approval_id)
            .ok_or_else(|| RelayError::Status {
                status: 404,
                body: format!("approval {approval_id} not found"),
            })?;
        if let Some(Step::Status(status)) = step {
            if !record.status.is_terminal() {
                record.status = status;
                if status.is_terminal() && status != ApprovalStatus::Invalidated {
                    record.decision_location = Some(DecisionLocation::Remote);
                }
            }
        }
        Ok(record.clone())
    }

    async fn ack_approval(&self, approval_id: &str) -> RelayResult<()> {
        self.enter(Op::Ack).await?;
        let mut state = self.lock();
        if let Some(record) = state.approvals.iter_mut().find(|a| a.id == approval_id) {
            record.processed = true;
        }
        state.acked.push(approval_id.to_string());
        Ok(())
    }

    async fn invalidate_approvals(&self, session_id: &str, reason: &str) -> RelayResult<()> {
        self.enter(Op::Invalidate).await?;
        let mut state = self.lock();
        for record in state
            .approvals
            .iter_mut()
            .filter(|a| a.session_id.as_deref() == Some(session_id))
            .filter(|a| a.status == ApprovalStatus::Pending)
        {
            record.status = ApprovalStatus::Invalidated;
            record.decision_reason = Some(reason.to_string());
        }
        state
            .invalidations
            .push((session_id.to_string(), reason.to_string()));
        Ok(())
    }

    async fn list_approvals(
        &self,
        status: ApprovalStatus,
        session_id: &str,
    ) -> RelayResult<Vec<ApprovalRecord>> {
        self.enter(Op::ListApprovals).await?;
        Ok(self
            .lock()
            .approvals
            .iter()
            .filter(|a| a.status == status && a.session_id.as_deref() == Some(session_id))
            .cloned()
            .collect())
    }

    async fn mute_status(&self, session_id: &str) -> RelayResult<bool> {
        self.enter(Op::Mute).await?;
        Ok(self
            .lock()
            .sessions
            .get(session_id)
            .map(|s| s.muted)
            .unwrap_or(false))
    }

    async fn notify(&self, session_id: &str, notification: &Notification) -> RelayResult<()> {
        self.enter(Op::Notify).await?;
        self.lock()
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .notifications
            .push(notification.clone());
        Ok(())
    }
}
