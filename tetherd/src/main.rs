use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tether_approval::{run_detached_poller, LivenessReporter, PollOutcome, PollSettings};
use tether_common::{is_valid_approval_id, is_valid_session_id, MarkerFileRegistry, TetherConfig};
use tether_relay::{DaemonStatePatch, RelayApi, RelayClient};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tetherd", version)]
#[command(about = "tether background worker: session heartbeat and detached approval polling")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report session liveness until the relay is unreachable or a signal arrives
    Heartbeat {
        #[arg(long)]
        session_id: String,

        /// Working directory reported at registration
        #[arg(long)]
        cwd: Option<String>,
    },
    /// Poll one approval after the hook handed it off
    AwaitApproval {
        #[arg(long)]
        session_id: String,

        #[arg(long)]
        approval_id: String,

        /// Remaining approval budget in milliseconds
        #[arg(long)]
        deadline_ms: u64,

        /// Mark the session away after this many milliseconds
        #[arg(long)]
        mark_away_after_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = TetherConfig::load();
    tether_common::logging::init(&config, cli.debug);

    let result = match cli.command {
        Command::Heartbeat { session_id, cwd } => heartbeat(&config, &session_id, cwd).await,
        Command::AwaitApproval {
            session_id,
            approval_id,
            deadline_ms,
            mark_away_after_ms,
        } => {
            await_approval(
                &config,
                &session_id,
                &approval_id,
                Duration::from_millis(deadline_ms),
                mark_away_after_ms.map(Duration::from_millis),
            )
            .await
        }
    };

    if let Err(err) = &result {
        error!("tetherd failed: {err:#}");
    }
    result
}

fn relay(config: &TetherConfig) -> Result<Arc<dyn RelayApi>> {
    let client = RelayClient::from_config(config).context("relay unavailable")?;
    Ok(Arc::new(client))
}

async fn heartbeat(config: &TetherConfig, session_id: &str, cwd: Option<String>) -> Result<()> {
    if !is_valid_session_id(session_id) {
        bail!("invalid session id");
    }
    let relay = relay(config)?;
    let state_dir = config
        .ensure_state_dir()
        .context("failed to create state directory")?;
    let registry = Arc::new(MarkerFileRegistry::new(state_dir));

    info!(session_id, pid = std::process::id(), "heartbeat reporter starting");
    let reporter = LivenessReporter::new(relay, registry, session_id, config.heartbeat)
        .with_cwd(cwd);
    let exit = reporter.run(shutdown_signal()).await?;
    info!(session_id, ?exit, "heartbeat reporter exiting");
    Ok(())
}

async fn await_approval(
    config: &TetherConfig,
    session_id: &str,
    approval_id: &str,
    deadline: Duration,
    mark_away_after: Option<Duration>,
) -> Result<()> {
    if !is_valid_session_id(session_id) {
        bail!("invalid session id");
    }
    let relay = relay(config)?;
    if !is_valid_approval_id(approval_id) {
        if let Err(err) = relay
            .patch_daemon_state(session_id, &DaemonStatePatch::stopped("invalid_request", None))
            .await
        {
            warn!(session_id, error = %err, "failed to record rejected handoff");
        }
        bail!("invalid approval id");
    }
    let settings = PollSettings {
        interval: config.poll_interval(),
        deadline,
        auto_away_after: mark_away_after,
    };

    info!(
        session_id,
        approval_id,
        deadline_ms = deadline.as_millis() as u64,
        "detached poller starting"
    );
    tokio::select! {
        outcome = run_detached_poller(relay.clone(), session_id, approval_id, settings) => {
            if outcome == PollOutcome::RelayUnreachable {
                warn!(session_id, approval_id, "gave up on unreachable relay");
            }
        }
        _ = shutdown_signal() => {
            info!(session_id, approval_id, "detached poller interrupted");
            if let Err(err) = relay
                .patch_daemon_state(session_id, &DaemonStatePatch::stopped("interrupted", None))
                .await
            {
                warn!(session_id, error = %err, "failed to record interruption");
            }
        }
    }
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                let _ = signal::ctrl_c().await;
                info!("Received Ctrl+C; shutting down");
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => info!("Received Ctrl+C; shutting down"),
            _ = sigterm.recv() => info!("Received SIGTERM; shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("Received Ctrl+C; shutting down");
    }
}
