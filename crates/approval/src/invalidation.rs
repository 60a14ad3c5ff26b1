//! Post-execution and end-of-session cleanup. Every step is best-effort.

use std::sync::Arc;

use tether_common::{is_valid_session_id, LivenessRegistry};
use tether_relay::RelayApi;
use tracing::{debug, info, warn};

use crate::handoff::HandoffController;
use crate::heartbeat::signal_reporter;

pub const TOOL_EXECUTED: &str = "tool_executed";
pub const SESSION_END: &str = "session_end";

/// A tool ran, whichever path allowed it: retire the session's pending
/// approval and close out a running handoff as a local resolution.
pub async fn on_tool_executed(
    relay: Arc<dyn RelayApi>,
    handoff: &HandoffController,
    session_id: &str,
) {
    if !is_valid_session_id(session_id) {
        debug!("invalid session id, skipping invalidation");
        return;
    }
    if let Err(err) = relay.invalidate_approvals(session_id, TOOL_EXECUTED).await {
        warn!(session_id, error = %err, "failed to invalidate after tool execution");
    }
    if let Err(err) = handoff.record_local_resolution(session_id).await {
        warn!(session_id, error = %format!("{err:#}"), "failed to record local resolution");
    }
}

/// The session is over: retire its pending approval and stop its reporter.
pub async fn on_session_end(
    relay: Arc<dyn RelayApi>,
    registry: &dyn LivenessRegistry,
    session_id: &str,
) {
    if !is_valid_session_id(session_id) {
        debug!("invalid session id, skipping session end");
        return;
    }
    if let Err(err) = relay.invalidate_approvals(session_id, SESSION_END).await {
        warn!(session_id, error = %err, "failed to invalidate at session end");
    }
    match signal_reporter(registry, session_id) {
        Ok(Some(pid)) => info!(session_id, pid, "signalled heartbeat reporter"),
        Ok(None) => debug!(session_id, "no heartbeat reporter to stop"),
        Err(err) => warn!(session_id, error = %err, "failed to signal heartbeat reporter"),
    }
}
