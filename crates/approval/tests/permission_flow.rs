use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::{json, Value};
use tether_approval::{
    ApprovalManager, DaemonJob, DaemonLauncher, DecisionKind, HookDecision, PermissionRequest,
};
use tether_common::{HandoffMode, PresenceFailSafe, TetherConfig};
use tether_relay::{
    ApprovalStatus, DaemonStatus, DecisionLocation, MemoryRelay, NewApproval, Op, RelayApi, Step,
};

const SESSION: &str = "12345678-1234-1234-1234-123456789012";

#[derive(Default)]
struct RecordingLauncher {
    jobs: Mutex<Vec<DaemonJob>>,
}

impl RecordingLauncher {
    fn jobs(&self) -> Vec<DaemonJob> {
        self.jobs.lock().unwrap().clone()
    }
}

impl DaemonLauncher for RecordingLauncher {
    fn launch(&self, job: &DaemonJob) -> Result<u32> {
        self.jobs.lock().unwrap().push(job.clone());
        Ok(31337)
    }
}

fn config(handoff: HandoffMode) -> TetherConfig {
    TetherConfig {
        relay_url: Some("http://relay.invalid".into()),
        api_key: Some("key".into()),
        poll_interval_ms: 10,
        fast_poll_window_ms: 5_000,
        approval_timeout_ms: 5_000,
        auto_away_ms: 60_000,
        handoff,
        ..TetherConfig::default()
    }
}

fn request(tool_input: Value) -> PermissionRequest {
    PermissionRequest {
        session_id: SESSION.into(),
        tool_name: "Bash".into(),
        tool_input,
    }
}

fn manager(
    config: TetherConfig,
    relay: &Arc<MemoryRelay>,
    launcher: &Arc<RecordingLauncher>,
) -> ApprovalManager {
    ApprovalManager::new(config, Some(relay.clone()), launcher.clone())
}

#[tokio::test]
async fn present_user_always_abstains() {
    for script in [
        vec![Step::Status(ApprovalStatus::Allowed)],
        vec![Step::Status(ApprovalStatus::Denied)],
        vec![Step::Fail],
    ] {
        let relay = Arc::new(MemoryRelay::new());
        relay.set_away(SESSION, false);
        relay.script_next_approval(script);
        let launcher = Arc::new(RecordingLauncher::default());

        let decision = manager(config(HandoffMode::Off), &relay, &launcher)
            .handle(&request(json!({ "command": "ls" })))
            .await;

        assert_eq!(decision, None);
        assert_eq!(relay.approvals().len(), 1, "record exists for visibility");
        assert_eq!(relay.calls(Op::Approval), 0, "present sessions are not polled");
        assert!(launcher.jobs().is_empty());
    }
}

#[tokio::test]
async fn away_user_gets_allow_on_third_poll() {
    let relay = Arc::new(MemoryRelay::new());
    relay.set_away(SESSION, true);
    relay.script_next_approval(vec![
        Step::Status(ApprovalStatus::Pending),
        Step::Status(ApprovalStatus::Pending),
        Step::Status(ApprovalStatus::Allowed),
    ]);
    let launcher = Arc::new(RecordingLauncher::default());

    let decision = manager(config(HandoffMode::Off), &relay, &launcher)
        .handle(&request(json!({ "command": "cargo publish" })))
        .await;

    assert_eq!(decision, Some(HookDecision::allow()));
    assert_eq!(relay.calls(Op::Approval), 3);
}

#[tokio::test]
async fn invalidated_approval_abstains() {
    let relay = Arc::new(MemoryRelay::new());
    relay.set_away(SESSION, true);
    relay.script_next_approval(vec![
        Step::Status(ApprovalStatus::Pending),
        Step::Status(ApprovalStatus::Invalidated),
    ]);
    let launcher = Arc::new(RecordingLauncher::default());

    let decision = manager(config(HandoffMode::Off), &relay, &launcher)
        .handle(&request(json!({})))
        .await;

    assert_eq!(decision, None);
}

#[tokio::test]
async fn new_request_invalidates_prior_pending_first() {
    let relay = Arc::new(MemoryRelay::new());
    let prior = relay
        .create_approval(&NewApproval {
            session_id: SESSION.into(),
            tool_name: "Edit".into(),
            tool_input: json!({}),
        })
        .await
        .unwrap();
    let launcher = Arc::new(RecordingLauncher::default());
    let manager = manager(config(HandoffMode::Off), &relay, &launcher);

    manager.handle(&request(json!({}))).await;
    manager.handle(&request(json!({}))).await;

    assert_eq!(relay.status_of(&prior), Some(ApprovalStatus::Invalidated));
    let log: Vec<Op> = relay
        .call_log()
        .into_iter()
        .filter(|op| matches!(op, Op::Invalidate | Op::CreateApproval))
        .collect();
    assert_eq!(
        log,
        vec![
            Op::CreateApproval,
            Op::Invalidate,
            Op::CreateApproval,
            Op::Invalidate,
            Op::CreateApproval
        ]
    );
    let pending = relay
        .approvals()
        .iter()
        .filter(|a| a.status == ApprovalStatus::Pending)
        .count();
    assert_eq!(pending, 1);
}

#[tokio::test]
async fn unconfigured_relay_abstains_for_any_input() {
    let launcher = Arc::new(RecordingLauncher::default());
    let manager = ApprovalManager::new(TetherConfig::default(), None, launcher.clone());

    for input in [
        json!({ "command": "ls" }),
        json!(null),
        json!("not an object"),
        json!([1, 2, 3]),
    ] {
        assert_eq!(manager.handle(&request(input)).await, None);
    }
    let bad_session = PermissionRequest {
        session_id: "garbage".into(),
        tool_name: String::new(),
        tool_input: json!({}),
    };
    assert_eq!(manager.handle(&bad_session).await, None);
    assert!(launcher.jobs().is_empty());
}

#[tokio::test]
async fn invalid_session_never_touches_relay() {
    let relay = Arc::new(MemoryRelay::new());
    let launcher = Arc::new(RecordingLauncher::default());
    let request = PermissionRequest {
        session_id: "12345678-1234-1234-1234-12345678901".into(),
        tool_name: "Bash".into(),
        tool_input: json!({}),
    };

    let decision = manager(config(HandoffMode::Off), &relay, &launcher)
        .handle(&request)
        .await;

    assert_eq!(decision, None);
    assert!(relay.call_log().is_empty());
}

#[tokio::test]
async fn creation_failure_abstains_without_polling() {
    let relay = Arc::new(MemoryRelay::new());
    relay.set_away(SESSION, true);
    relay.fail_always(Op::CreateApproval);
    let launcher = Arc::new(RecordingLauncher::default());

    let decision = manager(config(HandoffMode::Timeout), &relay, &launcher)
        .handle(&request(json!({})))
        .await;

    assert_eq!(decision, None);
    assert_eq!(relay.calls(Op::Approval), 0);
    assert!(launcher.jobs().is_empty());
}

#[tokio::test]
async fn invalidation_failure_is_not_fatal() {
    let relay = Arc::new(MemoryRelay::new());
    relay.set_away(SESSION, true);
    relay.fail_always(Op::Invalidate);
    relay.script_next_approval(vec![Step::Status(ApprovalStatus::Allowed)]);
    let launcher = Arc::new(RecordingLauncher::default());

    let decision = manager(config(HandoffMode::Off), &relay, &launcher)
        .handle(&request(json!({})))
        .await;

    assert_eq!(decision, Some(HookDecision::allow()));
}

#[tokio::test]
async fn denied_after_two_ticks() {
    let relay = Arc::new(MemoryRelay::new());
    relay.set_away(SESSION, true);
    relay.script_next_approval(vec![
        Step::Status(ApprovalStatus::Pending),
        Step::Status(ApprovalStatus::Denied),
    ]);
    let launcher = Arc::new(RecordingLauncher::default());

    let started = Instant::now();
    let decision = manager(config(HandoffMode::Timeout), &relay, &launcher)
        .handle(&request(json!({ "command": "rm -rf /tmp/scratch" })))
        .await;
    let elapsed = started.elapsed();

    let decision = decision.expect("remote deny");
    assert_eq!(decision.decision, DecisionKind::Deny);
    assert_eq!(
        serde_json::to_value(&decision).unwrap(),
        json!({ "decision": "deny", "reason": "denied remotely" })
    );
    assert!(elapsed >= Duration::from_millis(20), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
    assert!(launcher.jobs().is_empty());
}

#[tokio::test]
async fn relay_id_unfit_for_tetherd_is_polled_inline() {
    let relay = Arc::new(MemoryRelay::new());
    relay.set_away(SESSION, true);
    relay.assign_next_id("appr.01HZX3");
    let launcher = Arc::new(RecordingLauncher::default());
    let short_window = TetherConfig {
        fast_poll_window_ms: 30,
        approval_timeout_ms: 1_000,
        ..config(HandoffMode::Timeout)
    };

    let decision = manager(short_window, &relay, &launcher)
        .handle(&request(json!({})))
        .await;

    assert_eq!(decision, None);
    assert_eq!(relay.approvals()[0].id, "appr.01HZX3");
    assert!(launcher.jobs().is_empty());
    assert!(relay.calls(Op::Approval) > 10, "kept polling past the fast window");
    assert_ne!(relay.daemon_state_of(SESSION).status, DaemonStatus::Running);

    let relay = Arc::new(MemoryRelay::new());
    relay.set_away(SESSION, true);
    relay.assign_next_id("appr:7");
    relay.script_next_approval(vec![
        Step::Status(ApprovalStatus::Pending),
        Step::Status(ApprovalStatus::Allowed),
    ]);

    let decision = manager(config(HandoffMode::Proactive), &relay, &launcher)
        .handle(&request(json!({})))
        .await;

    assert_eq!(decision, Some(HookDecision::allow()));
    assert!(launcher.jobs().is_empty());
    assert_eq!(relay.calls(Op::PatchDaemonState), 0);
}

#[tokio::test]
async fn fast_window_expiry_hands_off_and_abstains() {
    let relay = Arc::new(MemoryRelay::new());
    relay.set_away(SESSION, true);
    let launcher = Arc::new(RecordingLauncher::default());
    let config = TetherConfig {
        fast_poll_window_ms: 30,
        approval_timeout_ms: 10_000,
        ..config(HandoffMode::Timeout)
    };

    let decision = manager(config, &relay, &launcher)
        .handle(&request(json!({})))
        .await;

    assert_eq!(decision, None);
    let jobs = launcher.jobs();
    assert_eq!(jobs.len(), 1);
    match &jobs[0] {
        DaemonJob::AwaitApproval {
            session_id,
            approval_id,
            deadline,
            mark_away_after,
        } => {
            assert_eq!(session_id, SESSION);
            assert_eq!(approval_id, &relay.approvals()[0].id);
            assert!(*deadline <= Duration::from_millis(9_970));
            assert!(*deadline > Duration::from_secs(9));
            assert_eq!(*mark_away_after, None, "relay already reports away");
        }
        other => panic!("unexpected job {other:?}"),
    }

    let state = relay.daemon_state_of(SESSION);
    assert_eq!(state.status, DaemonStatus::Running);
    assert_eq!(state.started_reason.as_deref(), Some("timeout"));
    assert_eq!(
        state.last_approval_location,
        Some(DecisionLocation::DaemonHandoff)
    );
}

#[tokio::test]
async fn proactive_handoff_precedes_inline_polling() {
    let relay = Arc::new(MemoryRelay::new());
    relay.set_away(SESSION, true);
    relay.script_next_approval(vec![Step::Status(ApprovalStatus::Allowed)]);
    let launcher = Arc::new(RecordingLauncher::default());

    let decision = manager(config(HandoffMode::Proactive), &relay, &launcher)
        .handle(&request(json!({})))
        .await;

    assert_eq!(decision, Some(HookDecision::allow()));
    assert_eq!(launcher.jobs().len(), 1);
    assert_eq!(
        relay.daemon_state_of(SESSION).started_reason.as_deref(),
        Some("proactive")
    );
}

#[tokio::test]
async fn unreachable_relay_mid_poll_abstains() {
    let relay = Arc::new(MemoryRelay::new());
    relay.set_away(SESSION, true);
    relay.fail_always(Op::Approval);
    let launcher = Arc::new(RecordingLauncher::default());

    let decision = manager(config(HandoffMode::Timeout), &relay, &launcher)
        .handle(&request(json!({})))
        .await;

    assert_eq!(decision, None);
    assert!(launcher.jobs().is_empty(), "no handoff against a dead relay");
}

#[tokio::test]
async fn fail_safe_away_polls_and_marks_session_away() {
    let relay = Arc::new(MemoryRelay::new());
    relay.fail_next(Op::DaemonState, 1);
    relay.script_next_approval(vec![
        Step::Status(ApprovalStatus::Pending),
        Step::Status(ApprovalStatus::Pending),
        Step::Status(ApprovalStatus::Allowed),
    ]);
    let launcher = Arc::new(RecordingLauncher::default());
    let config = TetherConfig {
        presence_failsafe: PresenceFailSafe::Away,
        auto_away_ms: 0,
        ..config(HandoffMode::Off)
    };

    let decision = manager(config, &relay, &launcher)
        .handle(&request(json!({})))
        .await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(decision, Some(HookDecision::allow()));
    assert!(relay.daemon_state_of(SESSION).is_away);
    assert_eq!(relay.calls(Op::PatchDaemonState), 1);
}

#[tokio::test]
async fn fail_safe_present_abstains_when_relay_state_unreadable() {
    let relay = Arc::new(MemoryRelay::new());
    relay.set_away(SESSION, true);
    relay.fail_always(Op::DaemonState);
    let launcher = Arc::new(RecordingLauncher::default());

    let decision = manager(config(HandoffMode::Off), &relay, &launcher)
        .handle(&request(json!({})))
        .await;

    assert_eq!(decision, None);
    assert_eq!(relay.calls(Op::Approval), 0);
}

#[tokio::test]
async fn relay_trait_object_is_usable_directly() {
    let relay: Arc<dyn RelayApi> = Arc::new(MemoryRelay::new());
    let launcher = Arc::new(RecordingLauncher::default());
    let manager = ApprovalManager::new(config(HandoffMode::Off), Some(relay), launcher);
    assert_eq!(manager.handle(&request(json!({}))).await, None);
}
