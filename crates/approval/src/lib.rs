pub mod handoff;
pub mod heartbeat;
pub mod invalidation;
pub mod launcher;
pub mod manager;
pub mod mute;
pub mod poller;
pub mod presence;

pub use handoff::{run_detached_poller, HandoffController, HandoffReason};
pub use heartbeat::{best_effort_acknowledge, signal_reporter, LivenessReporter, ReporterExit};
pub use invalidation::{on_session_end, on_tool_executed};
pub use launcher::{find_tetherd_binary, DaemonJob, DaemonLauncher, ProcessLauncher};
pub use manager::{ApprovalManager, DecisionKind, HookDecision, PermissionRequest};
pub use mute::MuteGate;
pub use poller::{
    observe, PollObservation, PollOutcome, PollSettings, Poller, MAX_CONSECUTIVE_POLL_FAILURES,
};
pub use presence::{Presence, PresenceOracle, PresenceSource};
