//! Permission-request handling.
//!
//! Every path that is not a remote allow/deny ends in `None`: the host's
//! own permission prompt decides. Nothing here returns an error to the
//! caller.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_common::{is_valid_approval_id, is_valid_session_id, HandoffMode, TetherConfig};
use tether_relay::{NewApproval, RelayApi};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::handoff::{HandoffController, HandoffReason};
use crate::launcher::DaemonLauncher;
use crate::poller::{PollOutcome, PollSettings, Poller};
use crate::presence::{Presence, PresenceOracle};

pub const ALLOW_REASON: &str = "approved remotely";
pub const DENY_REASON: &str = "denied remotely";

#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub session_id: String,
    pub tool_name: String,
    pub tool_input: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    Allow,
    Deny,
}

/// What the hook prints when a remote decision was reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookDecision {
    pub decision: DecisionKind,
    pub reason: String,
}

impl HookDecision {
    pub fn allow() -> Self {
        Self {
            decision: DecisionKind::Allow,
            reason: ALLOW_REASON.to_string(),
        }
    }

    pub fn deny() -> Self {
        Self {
            decision: DecisionKind::Deny,
            reason: DENY_REASON.to_string(),
        }
    }

    fn from_outcome(outcome: PollOutcome) -> Option<Self> {
        match outcome {
            PollOutcome::Allowed => Some(Self::allow()),
            PollOutcome::Denied => Some(Self::deny()),
            PollOutcome::Invalidated | PollOutcome::TimedOut | PollOutcome::RelayUnreachable => {
                None
            }
        }
    }
}

pub struct ApprovalManager {
    config: TetherConfig,
    relay: Option<Arc<dyn RelayApi>>,
    launcher: Arc<dyn DaemonLauncher>,
}

impl ApprovalManager {
    /// `relay` is `None` when no endpoint or key is configured.
    pub fn new(
        config: TetherConfig,
        relay: Option<Arc<dyn RelayApi>>,
        launcher: Arc<dyn DaemonLauncher>,
    ) -> Self {
        Self {
            config,
            relay,
            launcher,
        }
    }

    pub async fn handle(&self, request: &PermissionRequest) -> Option<HookDecision> {
        let session_id = request.session_id.as_str();
        if !is_valid_session_id(session_id) {
            debug!("invalid session id, abstaining");
            return None;
        }
        let Some(relay) = self.relay.clone() else {
            debug!(session_id, "relay not configured, abstaining");
            return None;
        };

        let presence = PresenceOracle::new(relay.clone(), self.config.presence_failsafe)
            .check(session_id)
            .await;

        if let Err(err) = relay.invalidate_approvals(session_id, "superseded").await {
            warn!(session_id, error = %err, "failed to invalidate previous approvals");
        }

        let approval_id = match relay
            .create_approval(&NewApproval {
                session_id: session_id.to_string(),
                tool_name: request.tool_name.clone(),
                tool_input: request.tool_input.clone(),
            })
            .await
        {
            Ok(id) => id,
            Err(err) => {
                warn!(session_id, tool = %request.tool_name, error = %err, "failed to create approval");
                return None;
            }
        };
        info!(
            session_id,
            approval_id = %approval_id,
            tool = %request.tool_name,
            away = presence.away,
            "approval created"
        );

        if !presence.away {
            return None;
        }

        let outcome = self
            .await_remote(relay, session_id, &approval_id, presence)
            .await;
        HookDecision::from_outcome(outcome)
    }

    async fn await_remote(
        &self,
        relay: Arc<dyn RelayApi>,
        session_id: &str,
        approval_id: &str,
        presence: Presence,
    ) -> PollOutcome {
        let started = Instant::now();
        let auto_away_after =
            (!presence.relay_reports_away()).then(|| self.config.auto_away_after());
        let handoff = HandoffController::new(relay.clone(), self.launcher.clone());
        let poller = Poller::new(relay, session_id, approval_id);
        let total = self.config.approval_timeout();

        let mode = if is_valid_approval_id(approval_id) {
            self.config.handoff
        } else {
            warn!(session_id, approval_id, "approval id cannot be handed off, polling inline");
            HandoffMode::Off
        };

        match mode {
            HandoffMode::Off => {
                poller
                    .run(PollSettings {
                        interval: self.config.poll_interval(),
                        deadline: total,
                        auto_away_after,
                    })
                    .await
            }
            HandoffMode::Proactive => {
                if let Err(err) = handoff
                    .hand_off(
                        session_id,
                        approval_id,
                        total,
                        auto_away_after,
                        HandoffReason::Proactive,
                    )
                    .await
                {
                    warn!(session_id, error = %err, "proactive handoff failed");
                }
                poller
                    .run(PollSettings {
                        interval: self.config.poll_interval(),
                        deadline: self.config.fast_poll_window().min(total),
                        auto_away_after,
                    })
                    .await
            }
            HandoffMode::Timeout => {
                let window = self.config.fast_poll_window().min(total);
                let outcome = poller
                    .run(PollSettings {
                        interval: self.config.poll_interval(),
                        deadline: window,
                        auto_away_after,
                    })
                    .await;
                if outcome != PollOutcome::TimedOut {
                    return outcome;
                }

                let elapsed = started.elapsed();
                let remaining = total.saturating_sub(elapsed);
                if remaining.is_zero() {
                    return outcome;
                }
                let mark_away_after = auto_away_after.map(|after| after.saturating_sub(elapsed));
                if let Err(err) = handoff
                    .hand_off(
                        session_id,
                        approval_id,
                        remaining,
                        mark_away_after,
                        HandoffReason::Timeout,
                    )
                    .await
                {
                    warn!(session_id, error = %err, "handoff after fast window failed");
                }
                outcome
            }
        }
    }
}
