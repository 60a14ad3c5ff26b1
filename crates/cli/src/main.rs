// # -----------------------------
// # crates/cli/src/main.rs
// # -----------------------------
use std::io::{stdin, stdout, Read, Write};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tether_approval::MuteGate;
use tether_cli::hook::{abstain, HookContext, HookEvent};
use tether_common::{is_valid_session_id, TetherConfig};

#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "tether - remote approvals for agent tool permissions", long_about = None)]
struct Cli {
    /// Force debug logging (written to tether.log in the state directory)
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Handle one host hook event: JSON on stdin, JSON on stdout, always exit 0
    Hook {
        #[arg(value_enum)]
        event: HookEvent,
    },
    /// Manage the notification mute cache
    Mute {
        #[command(subcommand)]
        action: MuteAction,
    },
    /// Print the resolved configuration and where each value came from
    Config,
}

#[derive(Subcommand, Debug)]
enum MuteAction {
    /// Forget the cached mute state of one session
    Clear { session_id: String },
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        // An unknown hook event must not break the host: abstain.
        Err(err) if is_hook_invocation() && !is_informational(&err) => {
            println!("{}", abstain());
            return ExitCode::SUCCESS;
        }
        Err(err) => err.exit(),
    };
    let config = TetherConfig::load();
    tether_common::logging::init(&config, cli.debug);

    match cli.command {
        Commands::Hook { event } => {
            let output = run_hook(config, event);
            let mut out = stdout().lock();
            let _ = writeln!(out, "{output}");
            let _ = out.flush();
            ExitCode::SUCCESS
        }
        Commands::Mute {
            action: MuteAction::Clear { session_id },
        } => report(clear_mute(&config, &session_id)),
        Commands::Config => report(print_config(&config)),
    }
}

fn is_hook_invocation() -> bool {
    std::env::args().skip(1).find(|arg| !arg.starts_with('-')).as_deref() == Some("hook")
}

fn is_informational(err: &clap::Error) -> bool {
    matches!(
        err.kind(),
        clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
    )
}

fn report(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run_hook(config: TetherConfig, event: HookEvent) -> Value {
    let mut raw = Vec::new();
    if let Err(err) = stdin().read_to_end(&mut raw) {
        tracing::debug!(error = %err, "failed to read hook input");
        return abstain();
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::warn!(error = %err, "failed to start runtime");
            return abstain();
        }
    };
    let ctx = HookContext::from_config(config);
    runtime.block_on(ctx.dispatch(event, &raw))
}

fn clear_mute(config: &TetherConfig, session_id: &str) -> Result<()> {
    if !is_valid_session_id(session_id) {
        anyhow::bail!("invalid session id: {session_id}");
    }
    let existed = MuteGate::clear_in(&config.state_dir, session_id)
        .context("failed to update mute cache")?;
    println!(
        "{}",
        json!({ "session_id": session_id, "cleared": existed })
    );
    Ok(())
}

fn print_config(config: &TetherConfig) -> Result<()> {
    let mut value = serde_json::to_value(config).context("failed to serialize configuration")?;
    if let Value::Object(map) = &mut value {
        map.insert(
            "api_key".into(),
            if config.api_key.is_some() {
                json!("<redacted>")
            } else {
                Value::Null
            },
        );
        map.insert("configured".into(), json!(config.is_configured()));
    }
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
