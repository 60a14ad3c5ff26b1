use std::fs::OpenOptions;
use std::io;
use std::sync::Mutex;

use tracing::warn;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::TetherConfig;

pub const LOG_FILE: &str = "tether.log";

/// Install the global subscriber.
///
/// Hook stdout carries the decision, so diagnostics go to `tether.log` in
/// the state directory and only fall back to stderr when that file cannot
/// be opened or the directory is not private to this user. `debug` forces the debug level regardless of configuration.
pub fn init(config: &TetherConfig, debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let file = config.ensure_state_dir().and_then(|dir| {
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options
                .mode(0o600)
                .custom_flags(nix::fcntl::OFlag::O_NOFOLLOW.bits());
        }
        options.open(dir.join(LOG_FILE))
    });

    let installed = match file {
        Ok(file) => fmt()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_target(true)
            .try_init()
            .is_ok(),
        Err(_) => fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init()
            .is_ok(),
    };

    if installed {
        for warning in &config.warnings {
            warn!(target: "tether::config", "{}", warning);
        }
    }
}
