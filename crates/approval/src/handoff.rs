//! Escalation from inline polling to a detached `tetherd await-approval`.
//!
//! Daemon-state writes made here are telemetry for other surfaces. They
//! are last-write-wins on the relay and nothing in this crate reads them
//! back to make a decision, apart from `record_local_resolution` skipping
//! its write when no handoff is running.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tether_common::is_valid_approval_id;
use tether_relay::{DaemonStatePatch, DaemonStatus, DecisionLocation, RelayApi};
use tracing::{info, warn};

use crate::launcher::{DaemonJob, DaemonLauncher};
use crate::poller::{PollOutcome, PollSettings, Poller};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffReason {
    /// The fast inline window ran out.
    Timeout,
    /// Configured to hand off before polling inline.
    Proactive,
}

impl HandoffReason {
    pub fn as_str(self) -> &'static str {
        match self {
            HandoffReason::Timeout => "timeout",
            HandoffReason::Proactive => "proactive",
        }
    }
}

pub struct HandoffController {
    relay: Arc<dyn RelayApi>,
    launcher: Arc<dyn DaemonLauncher>,
}

impl HandoffController {
    pub fn new(relay: Arc<dyn RelayApi>, launcher: Arc<dyn DaemonLauncher>) -> Self {
        Self { relay, launcher }
    }

    /// Mark the session as running a handoff and start the detached poller.
    ///
    /// If the poller cannot be started the record is put back to `stopped`
    /// so it is not left running with nobody polling.
    pub async fn hand_off(
        &self,
        session_id: &str,
        approval_id: &str,
        remaining: Duration,
        mark_away_after: Option<Duration>,
        reason: HandoffReason,
    ) -> Result<u32> {
        if !is_valid_approval_id(approval_id) {
            bail!("approval id {approval_id:?} is not accepted by tetherd");
        }
        if let Err(err) = self
            .relay
            .patch_daemon_state(session_id, &DaemonStatePatch::running(reason.as_str()))
            .await
        {
            warn!(session_id, error = %err, "failed to record handoff start");
        }

        let job = DaemonJob::AwaitApproval {
            session_id: session_id.to_string(),
            approval_id: approval_id.to_string(),
            deadline: remaining,
            mark_away_after,
        };
        match self.launcher.launch(&job) {
            Ok(pid) => {
                info!(
                    session_id,
                    approval_id,
                    pid,
                    reason = reason.as_str(),
                    remaining_ms = remaining.as_millis() as u64,
                    "approval handed off"
                );
                Ok(pid)
            }
            Err(err) => {
                if let Err(patch_err) = self
                    .relay
                    .patch_daemon_state(
                        session_id,
                        &DaemonStatePatch::stopped("handoff_failed", None),
                    )
                    .await
                {
                    warn!(session_id, error = %patch_err, "failed to record handoff failure");
                }
                Err(err).context("failed to launch detached approval poller")
            }
        }
    }

    /// The host resolved the request itself. Returns whether a running
    /// handoff was stopped.
    pub async fn record_local_resolution(&self, session_id: &str) -> Result<bool> {
        let state = self
            .relay
            .daemon_state(session_id)
            .await
            .context("failed to read daemon state")?;
        if state.status != DaemonStatus::Running {
            return Ok(false);
        }
        self.relay
            .patch_daemon_state(
                session_id,
                &DaemonStatePatch::stopped("local_approval", Some(DecisionLocation::Local)),
            )
            .await
            .context("failed to record local resolution")?;
        info!(session_id, "handoff stopped by local resolution");
        Ok(true)
    }
}

/// Body of `tetherd await-approval`: poll to the deadline, then close out
/// the daemon-state record according to how polling ended.
pub async fn run_detached_poller(
    relay: Arc<dyn RelayApi>,
    session_id: &str,
    approval_id: &str,
    settings: PollSettings,
) -> PollOutcome {
    let outcome = Poller::new(relay.clone(), session_id, approval_id)
        .run(settings)
        .await;

    let patch = match outcome {
        PollOutcome::Allowed | PollOutcome::Denied => {
            DaemonStatePatch::stopped("remote_decision", Some(DecisionLocation::Remote))
        }
        PollOutcome::Invalidated => DaemonStatePatch::stopped("invalidated", None),
        PollOutcome::TimedOut => DaemonStatePatch::stopped("timeout", None),
        PollOutcome::RelayUnreachable => DaemonStatePatch::stopped("relay_unreachable", None),
    };
    if let Err(err) = relay.patch_daemon_state(session_id, &patch).await {
        warn!(session_id, approval_id, error = %err, "failed to record poller stop");
    }
    info!(session_id, approval_id, ?outcome, "detached poller finished");
    outcome
}
