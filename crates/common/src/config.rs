//! Resolved runtime configuration.
//!
//! Values come from built-in defaults, an optional TOML file and the
//! environment, in increasing order of precedence. Every numeric knob is
//! clamped so a bad value can neither stall a hook nor flood the relay.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_FAST_POLL_WINDOW_MS: u64 = 25_000;
pub const DEFAULT_APPROVAL_TIMEOUT_MS: u64 = 5 * 60 * 1_000;
pub const DEFAULT_AUTO_AWAY_MS: u64 = 60_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_HEARTBEAT_START_DELAY_MS: u64 = 2_000;
pub const DEFAULT_HEARTBEAT_MAX_FAILURES: u64 = 5;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_HEARTBEAT_RETRIES: u64 = 2;
pub const DEFAULT_HEARTBEAT_BACKOFF_MS: u64 = 500;
pub const DEFAULT_MUTE_TTL_MS: u64 = 30_000;
pub const DEFAULT_LOG_LEVEL: &str = "info";

pub const CONFIG_PATH_ENV: &str = "TETHER_CONFIG";

/// Decision taken when the presence check cannot be completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceFailSafe {
    Present,
    Away,
}

impl PresenceFailSafe {
    pub fn is_away(self) -> bool {
        matches!(self, PresenceFailSafe::Away)
    }
}

impl FromStr for PresenceFailSafe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" | "here" => Ok(PresenceFailSafe::Present),
            "away" => Ok(PresenceFailSafe::Away),
            other => Err(format!("unknown presence fail-safe '{other}'")),
        }
    }
}

/// When an away-mode approval is escalated to the detached poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffMode {
    /// Never hand off; the hook polls until the full approval timeout.
    Off,
    /// Hand off once the fast-poll window expires unresolved.
    Timeout,
    /// Hand off before inline polling starts.
    Proactive,
}

impl FromStr for HandoffMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" | "false" | "no" => Ok(HandoffMode::Off),
            "timeout" | "1" | "true" | "yes" | "on" => Ok(HandoffMode::Timeout),
            "proactive" => Ok(HandoffMode::Proactive),
            other => Err(format!("unknown handoff mode '{other}'")),
        }
    }
}

/// Where a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Default,
    File,
    Env,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Default => f.write_str("default"),
            Source::File => f.write_str("file"),
            Source::Env => f.write_str("env"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub start_delay_ms: u64,
    pub max_failures: u32,
    pub timeout_ms: u64,
    pub retries: u32,
    pub backoff_ms: u64,
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            start_delay_ms: DEFAULT_HEARTBEAT_START_DELAY_MS,
            max_failures: DEFAULT_HEARTBEAT_MAX_FAILURES as u32,
            timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            retries: DEFAULT_HEARTBEAT_RETRIES as u32,
            backoff_ms: DEFAULT_HEARTBEAT_BACKOFF_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TetherConfig {
    pub relay_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub fast_poll_window_ms: u64,
    pub approval_timeout_ms: u64,
    pub auto_away_ms: u64,
    pub presence_failsafe: PresenceFailSafe,
    pub handoff: HandoffMode,
    pub heartbeat: HeartbeatConfig,
    pub mute_ttl_ms: u64,
    pub state_dir: PathBuf,
    pub log_level: String,
    /// Origin of each resolved key, for `tether config`.
    pub sources: BTreeMap<&'static str, Source>,
    /// Problems found while resolving; logged once logging is up.
    #[serde(skip_serializing)]
    pub warnings: Vec<String>,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            relay_url: None,
            api_key: None,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            fast_poll_window_ms: DEFAULT_FAST_POLL_WINDOW_MS,
            approval_timeout_ms: DEFAULT_APPROVAL_TIMEOUT_MS,
            auto_away_ms: DEFAULT_AUTO_AWAY_MS,
            presence_failsafe: PresenceFailSafe::Present,
            handoff: HandoffMode::Timeout,
            heartbeat: HeartbeatConfig::default(),
            mute_ttl_ms: DEFAULT_MUTE_TTL_MS,
            state_dir: default_state_dir(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            sources: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }
}

/// On-disk shape of `config.toml`. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub relay_url: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub fast_poll_window_ms: Option<u64>,
    pub approval_timeout_ms: Option<u64>,
    pub auto_away_ms: Option<u64>,
    pub presence_failsafe: Option<PresenceFailSafe>,
    pub handoff: Option<HandoffMode>,
    pub mute_ttl_ms: Option<u64>,
    pub state_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub heartbeat: FileHeartbeat,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileHeartbeat {
    pub interval_ms: Option<u64>,
    pub start_delay_ms: Option<u64>,
    pub max_failures: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<u64>,
    pub backoff_ms: Option<u64>,
}

impl TetherConfig {
    /// Load from the process environment and the optional config file.
    ///
    /// Never fails: an unreadable file is reported through `warnings` and
    /// ignored, because configuration problems must not block the host.
    pub fn load() -> Self {
        let mut warnings = Vec::new();
        let file = match config_file_path() {
            Some(path) => match load_file(&path) {
                Ok(file) => file,
                Err(err) => {
                    warnings.push(format!("ignoring config file: {err:#}"));
                    None
                }
            },
            None => None,
        };

        let mut config = Self::resolve(file, |name| std::env::var(name).ok());
        warnings.append(&mut config.warnings);
        config.warnings = warnings;
        config
    }

    /// Resolve from an explicit file and environment lookup.
    pub fn resolve<F>(file: Option<FileConfig>, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = file.unwrap_or_default();
        let mut r = Resolver {
            env: &env,
            sources: BTreeMap::new(),
            warnings: Vec::new(),
        };

        let relay_url = r
            .string("relay_url", "TETHER_RELAY_URL", file.relay_url)
            .and_then(|url| normalize_relay_url(&url, &mut r.warnings));
        let api_key = r.string("api_key", "TETHER_API_KEY", file.api_key);

        let request_timeout_ms = r.number(
            "request_timeout_ms",
            "TETHER_REQUEST_TIMEOUT_MS",
            file.request_timeout_ms,
            DEFAULT_REQUEST_TIMEOUT_MS,
            (100, 60_000),
        );
        let poll_interval_ms = r.number(
            "poll_interval_ms",
            "TETHER_POLL_INTERVAL_MS",
            file.poll_interval_ms,
            DEFAULT_POLL_INTERVAL_MS,
            (10, 60_000),
        );
        let fast_poll_window_ms = r.number(
            "fast_poll_window_ms",
            "TETHER_FAST_POLL_WINDOW_MS",
            file.fast_poll_window_ms,
            DEFAULT_FAST_POLL_WINDOW_MS,
            (0, 3_600_000),
        );
        let approval_timeout_ms = r.number(
            "approval_timeout_ms",
            "TETHER_APPROVAL_TIMEOUT_MS",
            file.approval_timeout_ms,
            DEFAULT_APPROVAL_TIMEOUT_MS,
            (1_000, 86_400_000),
        );
        let auto_away_ms = r.number(
            "auto_away_ms",
            "TETHER_AUTO_AWAY_MS",
            file.auto_away_ms,
            DEFAULT_AUTO_AWAY_MS,
            (0, 86_400_000),
        );
        let presence_failsafe = r.parsed(
            "presence_failsafe",
            "TETHER_PRESENCE_FAILSAFE",
            file.presence_failsafe,
            PresenceFailSafe::Present,
        );
        let handoff = r.parsed("handoff", "TETHER_HANDOFF", file.handoff, HandoffMode::Timeout);

        let heartbeat = HeartbeatConfig {
            interval_ms: r.number(
                "heartbeat.interval_ms",
                "TETHER_HEARTBEAT_INTERVAL_MS",
                file.heartbeat.interval_ms,
                DEFAULT_HEARTBEAT_INTERVAL_MS,
                (1_000, 600_000),
            ),
            start_delay_ms: r.number(
                "heartbeat.start_delay_ms",
                "TETHER_HEARTBEAT_START_DELAY_MS",
                file.heartbeat.start_delay_ms,
                DEFAULT_HEARTBEAT_START_DELAY_MS,
                (0, 60_000),
            ),
            max_failures: r.number(
                "heartbeat.max_failures",
                "TETHER_HEARTBEAT_MAX_FAILURES",
                file.heartbeat.max_failures,
                DEFAULT_HEARTBEAT_MAX_FAILURES,
                (1, 100),
            ) as u32,
            timeout_ms: r.number(
                "heartbeat.timeout_ms",
                "TETHER_HEARTBEAT_TIMEOUT_MS",
                file.heartbeat.timeout_ms,
                DEFAULT_HEARTBEAT_TIMEOUT_MS,
                (100, 60_000),
            ),
            retries: r.number(
                "heartbeat.retries",
                "TETHER_HEARTBEAT_RETRIES",
                file.heartbeat.retries,
                DEFAULT_HEARTBEAT_RETRIES,
                (0, 10),
            ) as u32,
            backoff_ms: r.number(
                "heartbeat.backoff_ms",
                "TETHER_HEARTBEAT_BACKOFF_MS",
                file.heartbeat.backoff_ms,
                DEFAULT_HEARTBEAT_BACKOFF_MS,
                (0, 10_000),
            ),
        };

        let mute_ttl_ms = r.number(
            "mute_ttl_ms",
            "TETHER_MUTE_TTL_MS",
            file.mute_ttl_ms,
            DEFAULT_MUTE_TTL_MS,
            (0, 3_600_000),
        );

        let state_dir = r
            .string(
                "state_dir",
                "TETHER_STATE_DIR",
                file.state_dir.map(|p| p.to_string_lossy().to_string()),
            )
            .map(PathBuf::from)
            .unwrap_or_else(default_state_dir);

        let log_level = (r.env)("TETHER_LOG")
            .or_else(|| (r.env)("RUST_LOG"))
            .filter(|v| !v.trim().is_empty())
            .map(|v| {
                r.sources.insert("log_level", Source::Env);
                v
            })
            .or_else(|| {
                file.log_level.map(|v| {
                    r.sources.insert("log_level", Source::File);
                    v
                })
            })
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        Self {
            relay_url,
            api_key,
            request_timeout_ms,
            poll_interval_ms,
            fast_poll_window_ms,
            approval_timeout_ms,
            auto_away_ms,
            presence_failsafe,
            handoff,
            heartbeat,
            mute_ttl_ms,
            state_dir,
            log_level,
            sources: r.sources,
            warnings: r.warnings,
        }
    }

    /// True when both the relay endpoint and its credentials are present.
    pub fn is_configured(&self) -> bool {
        self.relay_url.is_some() && self.api_key.is_some()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fast_poll_window(&self) -> Duration {
        Duration::from_millis(self.fast_poll_window_ms)
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_millis(self.approval_timeout_ms)
    }

    pub fn auto_away_after(&self) -> Duration {
        Duration::from_millis(self.auto_away_ms)
    }

    pub fn mute_ttl(&self) -> Duration {
        Duration::from_millis(self.mute_ttl_ms)
    }

    pub fn source_of(&self, key: &str) -> Source {
        self.sources.get(key).copied().unwrap_or(Source::Default)
    }

    /// Create `state_dir` (0700 on unix) and return it. A directory owned
    /// by someone else or open to group/other is refused.
    pub fn ensure_state_dir(&self) -> std::io::Result<&Path> {
        ensure_private_dir(&self.state_dir)?;
        Ok(&self.state_dir)
    }
}

/// Create `dir` owner-only, or verify an existing one is a real directory
/// owned by the current user with no group/other permission bits.
pub fn ensure_private_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::io::{Error, ErrorKind};
        use std::os::unix::fs::{DirBuilderExt, MetadataExt};

        std::fs::DirBuilder::new()
            .mode(0o700)
            .recursive(true)
            .create(dir)?;

        let meta = std::fs::symlink_metadata(dir)?;
        if !meta.is_dir() {
            return Err(Error::new(
                ErrorKind::PermissionDenied,
                format!("{} is not a directory", dir.display()),
            ));
        }
        if meta.uid() != nix::unistd::getuid().as_raw() {
            return Err(Error::new(
                ErrorKind::PermissionDenied,
                format!("{} is owned by uid {}", dir.display(), meta.uid()),
            ));
        }
        if meta.mode() & 0o077 != 0 {
            return Err(Error::new(
                ErrorKind::PermissionDenied,
                format!("{} has mode {:o}, expected owner-only", dir.display(), meta.mode() & 0o777),
            ));
        }
    }
    #[cfg(not(unix))]
    std::fs::create_dir_all(dir)?;
    Ok(())
}

struct Resolver<'a, F> {
    env: &'a F,
    sources: BTreeMap<&'static str, Source>,
    warnings: Vec<String>,
}

impl<'a, F> Resolver<'a, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(
        &mut self,
        key: &'static str,
        env_name: &str,
        file_value: Option<String>,
    ) -> Option<String> {
        if let Some(v) = (self.env)(env_name).filter(|v| !v.trim().is_empty()) {
            self.sources.insert(key, Source::Env);
            return Some(v.trim().to_string());
        }
        file_value
            .filter(|v| !v.trim().is_empty())
            .map(|v| {
                self.sources.insert(key, Source::File);
                v.trim().to_string()
            })
    }

    fn number(
        &mut self,
        key: &'static str,
        env_name: &str,
        file_value: Option<u64>,
        default: u64,
        (min, max): (u64, u64),
    ) -> u64 {
        if let Some(raw) = (self.env)(env_name) {
            match raw.trim().parse::<u64>() {
                Ok(v) => {
                    self.sources.insert(key, Source::Env);
                    return self.clamped(key, v, min, max);
                }
                Err(_) => self
                    .warnings
                    .push(format!("{env_name}={raw:?} is not a number; ignored")),
            }
        }
        if let Some(v) = file_value {
            self.sources.insert(key, Source::File);
            return self.clamped(key, v, min, max);
        }
        default
    }

    fn parsed<T>(&mut self, key: &'static str, env_name: &str, file_value: Option<T>, default: T) -> T
    where
        T: FromStr<Err = String>,
    {
        if let Some(raw) = (self.env)(env_name) {
            match raw.parse::<T>() {
                Ok(v) => {
                    self.sources.insert(key, Source::Env);
                    return v;
                }
                Err(err) => self.warnings.push(format!("{env_name}: {err}; ignored")),
            }
        }
        if let Some(v) = file_value {
            self.sources.insert(key, Source::File);
            return v;
        }
        default
    }

    fn clamped(&mut self, key: &str, v: u64, min: u64, max: u64) -> u64 {
        let c = clamp(v, min, max);
        if c != v {
            self.warnings
                .push(format!("{key}={v} out of range [{min}..{max}]; using {c}"));
        }
        c
    }
}

fn clamp(v: u64, min: u64, max: u64) -> u64 {
    if v < min {
        return min;
    }
    if v > max {
        return max;
    }
    v
}

fn normalize_relay_url(url: &str, warnings: &mut Vec<String>) -> Option<String> {
    let u = url.trim();
    if !(u.starts_with("http://") || u.starts_with("https://")) {
        warnings.push(format!(
            "relay url '{u}' must start with http:// or https://; relay disabled"
        ));
        return None;
    }
    Some(u.trim_end_matches('/').to_string())
}

/// `$TETHER_CONFIG`, else `$HOME/.config/tether/config.toml` when it exists.
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .ok()?;
    let candidate = PathBuf::from(home).join(".config/tether/config.toml");
    candidate.is_file().then_some(candidate)
}

/// Parse a config file. A missing file is not an error.
pub fn load_file(path: &Path) -> Result<Option<FileConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let parsed: FileConfig =
        toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(parsed))
}

fn default_state_dir() -> PathBuf {
    #[cfg(unix)]
    let name = format!("tether-{}", nix::unistd::getuid());
    #[cfg(not(unix))]
    let name = "tether".to_string();
    std::env::temp_dir().join(name)
}
