//! Liveness reporter bound to one session.
//!
//! Holds the session's liveness marker for its whole run and releases it
//! on every exit path. The exposed count only moves once the relay has
//! accepted a send.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tether_common::{HeartbeatConfig, LivenessRegistry, Marker};
use tether_relay::{ApprovalStatus, HeartbeatBody, RelayApi, SessionMeta};
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReporterExit {
    /// `max_failures` consecutive sends failed.
    FailureLimit,
    /// Shutdown was requested (SIGINT/SIGTERM).
    Signal,
    /// Another reporter already holds the session.
    AlreadyRunning,
}

pub struct LivenessReporter {
    relay: Arc<dyn RelayApi>,
    registry: Arc<dyn LivenessRegistry>,
    session_id: String,
    config: HeartbeatConfig,
    cwd: Option<String>,
    confirmed: AtomicU64,
    failures: AtomicU32,
}

impl LivenessReporter {
    pub fn new(
        relay: Arc<dyn RelayApi>,
        registry: Arc<dyn LivenessRegistry>,
        session_id: &str,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            relay,
            registry,
            session_id: session_id.to_string(),
            config,
            cwd: None,
            confirmed: AtomicU64::new(0),
            failures: AtomicU32::new(0),
        }
    }

    pub fn with_cwd(mut self, cwd: Option<String>) -> Self {
        self.cwd = cwd;
        self
    }

    /// Heartbeats the relay has accepted.
    pub fn confirmed_count(&self) -> u64 {
        self.confirmed.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Run until the failure limit or until `shutdown` resolves.
    pub async fn run<S>(&self, shutdown: S) -> Result<ReporterExit>
    where
        S: Future<Output = ()>,
    {
        let marker = Marker::for_current_process(&self.session_id);
        if !self
            .registry
            .try_acquire(&marker)
            .context("failed to acquire liveness marker")?
        {
            info!(session_id = %self.session_id, "reporter already running");
            return Ok(ReporterExit::AlreadyRunning);
        }

        tokio::pin!(shutdown);
        let exit = tokio::select! {
            exit = self.beat_loop() => exit,
            _ = &mut shutdown => ReporterExit::Signal,
        };

        self.release_marker();
        info!(
            session_id = %self.session_id,
            confirmed = self.confirmed_count(),
            ?exit,
            "reporter stopped"
        );
        Ok(exit)
    }

    async fn beat_loop(&self) -> ReporterExit {
        let meta = SessionMeta::current(self.cwd.clone());
        if let Err(err) = self.relay.register_session(&self.session_id, &meta).await {
            warn!(session_id = %self.session_id, error = %err, "session registration failed");
        }

        sleep(self.config.start_delay()).await;
        loop {
            self.beat_once().await;
            if self.consecutive_failures() >= self.config.max_failures {
                warn!(
                    session_id = %self.session_id,
                    failures = self.consecutive_failures(),
                    "heartbeat failure limit reached"
                );
                return ReporterExit::FailureLimit;
            }
            sleep(self.config.interval()).await;
        }
    }

    /// Send one heartbeat with retries. Returns whether it was confirmed.
    pub async fn beat_once(&self) -> bool {
        // Beats are sequential, so the next count is known before sending.
        let count = self.confirmed.load(Ordering::SeqCst) + 1;
        let body = HeartbeatBody {
            timestamp: Utc::now(),
            pid: std::process::id(),
            count,
        };

        let mut last_error = None;
        for attempt in 0..=self.config.retries {
            if attempt > 0 {
                sleep(self.config.backoff() * attempt).await;
            }
            match self
                .relay
                .heartbeat_with_timeout(&self.session_id, &body, self.config.timeout())
                .await
            {
                Ok(()) => {
                    self.confirmed.fetch_add(1, Ordering::SeqCst);
                    self.failures.store(0, Ordering::SeqCst);
                    debug!(session_id = %self.session_id, count, "heartbeat sent");
                    let relay = self.relay.clone();
                    let session_id = self.session_id.clone();
                    tokio::spawn(async move {
                        best_effort_acknowledge(relay.as_ref(), &session_id).await;
                    });
                    return true;
                }
                Err(err) => last_error = Some(err),
            }
        }

        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(err) = last_error {
            warn!(session_id = %self.session_id, failures, error = %err, "heartbeat failed");
        }
        false
    }

    fn release_marker(&self) {
        if let Err(err) = self.registry.release(&self.session_id) {
            warn!(session_id = %self.session_id, error = %err, "failed to remove liveness marker");
        }
    }
}

/// Acknowledge remotely allowed approvals nobody consumed yet. Returns how
/// many were acknowledged; every error is swallowed.
pub async fn best_effort_acknowledge(relay: &dyn RelayApi, session_id: &str) -> usize {
    let approvals = match relay
        .list_approvals(ApprovalStatus::Allowed, session_id)
        .await
    {
        Ok(list) => list,
        Err(err) => {
            debug!(session_id, error = %err, "ack sweep could not list approvals");
            return 0;
        }
    };

    let mut acked = 0;
    for approval in approvals.iter().filter(|a| !a.processed && !a.id.is_empty()) {
        match relay.ack_approval(&approval.id).await {
            Ok(()) => acked += 1,
            Err(err) => debug!(approval_id = %approval.id, error = %err, "ack failed"),
        }
    }
    if acked > 0 {
        info!(session_id, acked, "acknowledged remote approvals");
    }
    acked
}

/// Ask the session's reporter to stop. Returns the signalled pid.
///
/// A marker whose process is gone is removed, which clears an orphan left
/// by a killed reporter.
pub fn signal_reporter(registry: &dyn LivenessRegistry, session_id: &str) -> io::Result<Option<u32>> {
    let Some(marker) = registry.holder(session_id)? else {
        return Ok(None);
    };

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(marker.pid as i32), Signal::SIGTERM) {
            Ok(()) => Ok(Some(marker.pid)),
            Err(Errno::ESRCH) => {
                debug!(session_id, pid = marker.pid, "reporter gone, clearing marker");
                registry.release(session_id)?;
                Ok(None)
            }
            Err(err) => Err(io::Error::from_raw_os_error(err as i32)),
        }
    }

    #[cfg(not(unix))]
    {
        registry.release(session_id)?;
        Ok(Some(marker.pid))
    }
}
