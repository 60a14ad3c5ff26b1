//! Fixed-interval polling of one approval record.
//!
//! The loop only ever looks at approval status. Daemon state is written as
//! a side effect (auto-away) but never read back into the decision.

use std::sync::Arc;
use std::time::Duration;

use tether_relay::{ApprovalStatus, DaemonStatePatch, RelayApi};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Consecutive transport errors tolerated before the loop gives up. The
/// error after the last tolerated one aborts.
pub const MAX_CONSECUTIVE_POLL_FAILURES: u32 = 3;

/// One look at an approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollObservation {
    Pending,
    Allowed,
    Denied,
    Invalidated,
    TransportError(String),
}

/// How a polling run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Allowed,
    Denied,
    Invalidated,
    TimedOut,
    RelayUnreachable,
}

impl PollOutcome {
    pub fn is_decision(self) -> bool {
        matches!(self, PollOutcome::Allowed | PollOutcome::Denied)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    /// Budget for this run, measured from its start.
    pub deadline: Duration,
    /// Mark the session away once this much time has passed. `None` when
    /// the relay already reports the session away.
    pub auto_away_after: Option<Duration>,
}

pub async fn observe(relay: &dyn RelayApi, approval_id: &str) -> PollObservation {
    match relay.approval(approval_id).await {
        Ok(record) => match record.status {
            ApprovalStatus::Allowed => PollObservation::Allowed,
            ApprovalStatus::Denied => PollObservation::Denied,
            ApprovalStatus::Invalidated | ApprovalStatus::Expired => PollObservation::Invalidated,
            ApprovalStatus::Pending | ApprovalStatus::Unknown => PollObservation::Pending,
        },
        Err(err) => PollObservation::TransportError(err.to_string()),
    }
}

pub struct Poller {
    relay: Arc<dyn RelayApi>,
    session_id: String,
    approval_id: String,
}

impl Poller {
    pub fn new(relay: Arc<dyn RelayApi>, session_id: &str, approval_id: &str) -> Self {
        Self {
            relay,
            session_id: session_id.to_string(),
            approval_id: approval_id.to_string(),
        }
    }

    pub async fn run(&self, settings: PollSettings) -> PollOutcome {
        let started = Instant::now();
        let mut failures = 0u32;
        let mut marked_away = settings.auto_away_after.is_none();

        loop {
            let elapsed = started.elapsed();
            if elapsed >= settings.deadline {
                info!(
                    session_id = %self.session_id,
                    approval_id = %self.approval_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "approval still pending at deadline"
                );
                return PollOutcome::TimedOut;
            }
            sleep(settings.interval.min(settings.deadline - elapsed)).await;

            match observe(self.relay.as_ref(), &self.approval_id).await {
                PollObservation::Allowed => {
                    self.acknowledge().await;
                    return PollOutcome::Allowed;
                }
                PollObservation::Denied => {
                    self.acknowledge().await;
                    return PollOutcome::Denied;
                }
                PollObservation::Invalidated => {
                    debug!(approval_id = %self.approval_id, "approval superseded");
                    return PollOutcome::Invalidated;
                }
                PollObservation::Pending => {
                    failures = 0;
                    if let Some(after) = settings.auto_away_after {
                        if !marked_away && started.elapsed() >= after {
                            marked_away = true;
                            self.spawn_auto_away();
                        }
                    }
                }
                PollObservation::TransportError(error) => {
                    failures += 1;
                    warn!(
                        approval_id = %self.approval_id,
                        failures,
                        %error,
                        "approval poll failed"
                    );
                    if failures > MAX_CONSECUTIVE_POLL_FAILURES {
                        return PollOutcome::RelayUnreachable;
                    }
                }
            }
        }
    }

    /// Keeps the heartbeat sweep from revisiting a decision we already
    /// consumed. Failure only costs a redundant ack later.
    async fn acknowledge(&self) {
        if let Err(err) = self.relay.ack_approval(&self.approval_id).await {
            debug!(approval_id = %self.approval_id, error = %err, "ack failed");
        }
    }

    /// Detached `is_away: true` write; errors are logged and dropped.
    fn spawn_auto_away(&self) {
        let relay = self.relay.clone();
        let session_id = self.session_id.clone();
        info!(session_id = %session_id, "marking session away");
        tokio::spawn(async move {
            if let Err(err) = relay
                .patch_daemon_state(&session_id, &DaemonStatePatch::away())
                .await
            {
                warn!(session_id = %session_id, error = %err, "auto-away update failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_relay::{MemoryRelay, NewApproval, Op, Step};

    const SESSION: &str = "12345678-1234-1234-1234-123456789012";

    async fn approval(relay: &MemoryRelay) -> String {
        relay
            .create_approval(&NewApproval {
                session_id: SESSION.into(),
                tool_name: "Bash".into(),
                tool_input: json!({}),
            })
            .await
            .unwrap()
    }

    fn settings(deadline_ms: u64) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(10),
            deadline: Duration::from_millis(deadline_ms),
            auto_away_after: None,
        }
    }

    #[tokio::test]
    async fn allowed_on_third_poll() {
        let relay = Arc::new(MemoryRelay::new());
        relay.script_next_approval(vec![
            Step::Status(ApprovalStatus::Pending),
            Step::Status(ApprovalStatus::Pending),
            Step::Status(ApprovalStatus::Allowed),
        ]);
        let id = approval(&relay).await;

        let outcome = Poller::new(relay.clone(), SESSION, &id)
            .run(settings(5_000))
            .await;

        assert_eq!(outcome, PollOutcome::Allowed);
        assert_eq!(relay.calls(Op::Approval), 3);
        assert_eq!(relay.acked(), vec![id]);
    }

    #[tokio::test]
    async fn invalidated_is_not_a_decision() {
        let relay = Arc::new(MemoryRelay::new());
        relay.script_next_approval(vec![Step::Status(ApprovalStatus::Invalidated)]);
        let id = approval(&relay).await;

        let outcome = Poller::new(relay.clone(), SESSION, &id)
            .run(settings(5_000))
            .await;

        assert_eq!(outcome, PollOutcome::Invalidated);
        assert!(!outcome.is_decision());
        assert!(relay.acked().is_empty());
    }

    #[tokio::test]
    async fn aborts_after_consecutive_failures() {
        let relay = Arc::new(MemoryRelay::new());
        let id = approval(&relay).await;
        relay.fail_always(Op::Approval);

        let outcome = Poller::new(relay.clone(), SESSION, &id)
            .run(settings(5_000))
            .await;

        assert_eq!(outcome, PollOutcome::RelayUnreachable);
        assert_eq!(
            relay.calls(Op::Approval),
            MAX_CONSECUTIVE_POLL_FAILURES as usize + 1
        );
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let relay = Arc::new(MemoryRelay::new());
        relay.script_next_approval(vec![
            Step::Fail,
            Step::Fail,
            Step::Fail,
            Step::Status(ApprovalStatus::Pending),
            Step::Fail,
            Step::Fail,
            Step::Fail,
            Step::Status(ApprovalStatus::Denied),
        ]);
        let id = approval(&relay).await;

        let outcome = Poller::new(relay.clone(), SESSION, &id)
            .run(settings(5_000))
            .await;

        assert_eq!(outcome, PollOutcome::Denied);
    }

    #[tokio::test]
    async fn times_out_leaving_record_pending() {
        let relay = Arc::new(MemoryRelay::new());
        let id = approval(&relay).await;

        let outcome = Poller::new(relay.clone(), SESSION, &id)
            .run(settings(35))
            .await;

        assert_eq!(outcome, PollOutcome::TimedOut);
        assert_eq!(relay.status_of(&id), Some(ApprovalStatus::Pending));
        assert!(relay.invalidations().is_empty());
    }

    #[tokio::test]
    async fn marks_session_away_once() {
        let relay = Arc::new(MemoryRelay::new());
        let id = approval(&relay).await;

        let outcome = Poller::new(relay.clone(), SESSION, &id)
            .run(PollSettings {
                interval: Duration::from_millis(10),
                deadline: Duration::from_millis(80),
                auto_away_after: Some(Duration::ZERO),
            })
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(outcome, PollOutcome::TimedOut);
        assert_eq!(relay.calls(Op::PatchDaemonState), 1);
        assert!(relay.daemon_state_of(SESSION).is_away);
    }

    #[tokio::test]
    async fn auto_away_failure_does_not_change_outcome() {
        let relay = Arc::new(MemoryRelay::new());
        relay.fail_always(Op::PatchDaemonState);
        relay.script_next_approval(vec![
            Step::Status(ApprovalStatus::Pending),
            Step::Status(ApprovalStatus::Allowed),
        ]);
        let id = approval(&relay).await;

        let outcome = Poller::new(relay.clone(), SESSION, &id)
            .run(PollSettings {
                interval: Duration::from_millis(10),
                deadline: Duration::from_secs(5),
                auto_away_after: Some(Duration::ZERO),
            })
            .await;

        assert_eq!(outcome, PollOutcome::Allowed);
    }
}
