use std::sync::Arc;

use tether_common::PresenceFailSafe;
use tether_relay::RelayApi;
use tracing::{debug, warn};

/// Where an away/present answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceSource {
    Relay,
    FailSafe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Presence {
    pub away: bool,
    pub source: PresenceSource,
}

impl Presence {
    /// True when the relay itself has the session marked away, so an
    /// auto-away write would be redundant.
    pub fn relay_reports_away(&self) -> bool {
        self.away && self.source == PresenceSource::Relay
    }
}

/// Answers "is the operator away" from the session's daemon-state record.
///
/// Never fails: when the relay cannot be asked, the configured fail-safe
/// stands in. Nothing is cached here.
pub struct PresenceOracle {
    relay: Arc<dyn RelayApi>,
    fail_safe: PresenceFailSafe,
}

impl PresenceOracle {
    pub fn new(relay: Arc<dyn RelayApi>, fail_safe: PresenceFailSafe) -> Self {
        Self { relay, fail_safe }
    }

    pub async fn check(&self, session_id: &str) -> Presence {
        match self.relay.daemon_state(session_id).await {
            Ok(state) => {
                debug!(session_id, away = state.is_away, "presence from relay");
                Presence {
                    away: state.is_away,
                    source: PresenceSource::Relay,
                }
            }
            Err(err) => {
                warn!(
                    session_id,
                    error = %err,
                    fail_safe = ?self.fail_safe,
                    "presence check failed, using fail-safe"
                );
                Presence {
                    away: self.fail_safe.is_away(),
                    source: PresenceSource::FailSafe,
                }
            }
        }
    }

    pub async fn is_away(&self, session_id: &str) -> bool {
        self.check(session_id).await.away
    }
}
