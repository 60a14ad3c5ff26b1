//! Host hook events.
//!
//! Each event reads one JSON object and produces one JSON object. Nothing
//! here can fail from the host's point of view: bad input, missing
//! configuration and relay errors all end in `{}`.

use std::sync::Arc;

use clap::ValueEnum;
use serde::Deserialize;
use serde_json::{json, Value};
use tether_approval::{
    on_session_end, on_tool_executed, ApprovalManager, DaemonJob, DaemonLauncher,
    HandoffController, MuteGate, PermissionRequest, ProcessLauncher,
};
use tether_common::{is_valid_session_id, LivenessRegistry, MarkerFileRegistry, TetherConfig};
use tether_relay::{Notification, RelayApi, RelayClient, SessionMeta};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HookEvent {
    PermissionRequest,
    PostToolUse,
    SessionStart,
    SessionEnd,
    Notification,
}

/// Fields the host may send; every event uses a subset.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HookInput {
    #[serde(alias = "sessionId")]
    pub session_id: Option<String>,
    #[serde(alias = "toolName")]
    pub tool_name: Option<String>,
    #[serde(alias = "toolInput")]
    pub tool_input: Option<Value>,
    pub cwd: Option<String>,
    pub message: Option<String>,
    pub title: Option<String>,
    #[serde(alias = "notification_type")]
    pub kind: Option<String>,
}

impl HookInput {
    pub fn parse(raw: &[u8]) -> Option<Self> {
        match serde_json::from_slice::<Value>(raw) {
            Ok(value @ Value::Object(_)) => serde_json::from_value(value).ok(),
            _ => None,
        }
    }

    fn valid_session(&self) -> Option<&str> {
        self.session_id
            .as_deref()
            .filter(|id| is_valid_session_id(id))
    }
}

pub fn abstain() -> Value {
    json!({})
}

pub struct HookContext {
    config: TetherConfig,
    relay: Option<Arc<dyn RelayApi>>,
    launcher: Arc<dyn DaemonLauncher>,
    registry: Arc<dyn LivenessRegistry>,
}

impl HookContext {
    pub fn new(
        config: TetherConfig,
        relay: Option<Arc<dyn RelayApi>>,
        launcher: Arc<dyn DaemonLauncher>,
        registry: Arc<dyn LivenessRegistry>,
    ) -> Self {
        Self {
            config,
            relay,
            launcher,
            registry,
        }
    }

    /// Production wiring: HTTP relay when configured, detached `tetherd`,
    /// marker files under the state directory.
    pub fn from_config(config: TetherConfig) -> Self {
        let relay: Option<Arc<dyn RelayApi>> = if config.is_configured() {
            match RelayClient::from_config(&config) {
                Ok(client) => Some(Arc::new(client)),
                Err(err) => {
                    warn!(error = %err, "relay client unavailable");
                    None
                }
            }
        } else {
            None
        };
        let registry = Arc::new(MarkerFileRegistry::new(config.state_dir.clone()));
        Self::new(config, relay, Arc::new(ProcessLauncher::new()), registry)
    }

    pub async fn dispatch(&self, event: HookEvent, raw: &[u8]) -> Value {
        let Some(input) = HookInput::parse(raw) else {
            debug!(?event, "unparseable hook input");
            return abstain();
        };
        let Some(relay) = self.relay.clone() else {
            debug!(?event, "relay not configured");
            return abstain();
        };

        match event {
            HookEvent::PermissionRequest => self.permission_request(relay, input).await,
            HookEvent::PostToolUse => {
                if let Some(session_id) = input.valid_session() {
                    let handoff = HandoffController::new(relay.clone(), self.launcher.clone());
                    on_tool_executed(relay, &handoff, session_id).await;
                }
                abstain()
            }
            HookEvent::SessionStart => {
                if let Some(session_id) = input.valid_session() {
                    self.session_start(relay, session_id, input.cwd.clone()).await;
                }
                abstain()
            }
            HookEvent::SessionEnd => {
                if let Some(session_id) = input.valid_session() {
                    on_session_end(relay, self.registry.as_ref(), session_id).await;
                }
                abstain()
            }
            HookEvent::Notification => {
                if let Some(session_id) = input.valid_session() {
                    self.notification(relay, session_id, &input).await;
                }
                abstain()
            }
        }
    }

    async fn permission_request(&self, relay: Arc<dyn RelayApi>, input: HookInput) -> Value {
        let request = PermissionRequest {
            session_id: input.session_id.unwrap_or_default(),
            tool_name: input.tool_name.unwrap_or_default(),
            tool_input: input.tool_input.unwrap_or(Value::Null),
        };
        let manager = ApprovalManager::new(self.config.clone(), Some(relay), self.launcher.clone());
        match manager.handle(&request).await {
            Some(decision) => serde_json::to_value(decision).unwrap_or_else(|_| abstain()),
            None => abstain(),
        }
    }

    async fn session_start(&self, relay: Arc<dyn RelayApi>, session_id: &str, cwd: Option<String>) {
        if let Err(err) = relay
            .register_session(session_id, &SessionMeta::current(cwd.clone()))
            .await
        {
            warn!(session_id, error = %err, "session registration failed");
        }

        match self.registry.holder(session_id) {
            Ok(Some(marker)) => {
                debug!(session_id, pid = marker.pid, "heartbeat reporter already running");
                return;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(session_id, error = %err, "cannot read liveness marker");
                return;
            }
        }

        let job = DaemonJob::Heartbeat {
            session_id: session_id.to_string(),
            cwd,
        };
        match self.launcher.launch(&job) {
            Ok(pid) => info!(session_id, pid, "heartbeat reporter launched"),
            Err(err) => warn!(session_id, error = %format!("{err:#}"), "failed to launch heartbeat reporter"),
        }
    }

    async fn notification(&self, relay: Arc<dyn RelayApi>, session_id: &str, input: &HookInput) {
        let Some(message) = input.message.clone().filter(|m| !m.trim().is_empty()) else {
            return;
        };
        let gate = MuteGate::new(relay.clone(), &self.config.state_dir, self.config.mute_ttl());
        if gate.is_muted(session_id).await {
            debug!(session_id, "session muted, dropping notification");
            return;
        }
        let notification = Notification {
            title: input.title.clone(),
            message,
            kind: input.kind.clone(),
        };
        if let Err(err) = relay.notify(session_id, &notification).await {
            warn!(session_id, error = %err, "notification forward failed");
        }
    }
}
