use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

pub const TETHERD_BINARY_ENV: &str = "TETHERD_BINARY";

const TETHERD_FILE_NAME: &str = if cfg!(windows) { "tetherd.exe" } else { "tetherd" };

/// Work handed to a detached `tetherd` process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonJob {
    Heartbeat {
        session_id: String,
        cwd: Option<String>,
    },
    AwaitApproval {
        session_id: String,
        approval_id: String,
        deadline: Duration,
        mark_away_after: Option<Duration>,
    },
}

impl DaemonJob {
    pub fn args(&self) -> Vec<String> {
        match self {
            DaemonJob::Heartbeat { session_id, cwd } => {
                let mut args = vec!["heartbeat".into(), "--session-id".into(), session_id.clone()];
                if let Some(cwd) = cwd {
                    args.push("--cwd".into());
                    args.push(cwd.clone());
                }
                args
            }
            DaemonJob::AwaitApproval {
                session_id,
                approval_id,
                deadline,
                mark_away_after,
            } => {
                let mut args = vec![
                    "await-approval".into(),
                    "--session-id".into(),
                    session_id.clone(),
                    "--approval-id".into(),
                    approval_id.clone(),
                    "--deadline-ms".into(),
                    deadline.as_millis().to_string(),
                ];
                if let Some(after) = mark_away_after {
                    args.push("--mark-away-after-ms".into());
                    args.push(after.as_millis().to_string());
                }
                args
            }
        }
    }
}

/// Starts detached background work. Returns the child pid.
pub trait DaemonLauncher: Send + Sync {
    fn launch(&self, job: &DaemonJob) -> Result<u32>;
}

/// Spawns `tetherd` in its own session with null stdio, so it outlives
/// the hook and never writes to the host's decision channel.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    binary: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: Some(binary.into()),
        }
    }

    fn binary(&self) -> Result<PathBuf> {
        match &self.binary {
            Some(path) => Ok(path.clone()),
            None => find_tetherd_binary(),
        }
    }
}

impl DaemonLauncher for ProcessLauncher {
    fn launch(&self, job: &DaemonJob) -> Result<u32> {
        let binary = self.binary()?;
        let mut cmd = Command::new(&binary);
        cmd.args(job.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn tetherd at {}", binary.display()))?;
        info!(pid = child.id(), job = ?job, "spawned tetherd");
        Ok(child.id())
    }
}

/// Locate `tetherd`: `$TETHERD_BINARY`, then beside the running `tether`
/// executable, then `PATH`.
pub fn find_tetherd_binary() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os(TETHERD_BINARY_ENV).map(PathBuf::from) {
        if path.is_file() {
            return Ok(path);
        }
        debug!(path = %path.display(), "{TETHERD_BINARY_ENV} does not name a file");
    }

    let sibling = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(TETHERD_FILE_NAME)));
    if let Some(path) = sibling.filter(|p| p.is_file()) {
        return Ok(path);
    }

    let on_path = std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(TETHERD_FILE_NAME))
            .find(|candidate| candidate.is_file())
    });
    match on_path {
        Some(path) => Ok(path),
        None => {
            warn!("tetherd not found beside tether or on PATH");
            bail!("tetherd binary not found; install it next to tether or set {TETHERD_BINARY_ENV}")
        }
    }
}
