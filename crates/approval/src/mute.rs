//! Mute gate for outbound notifications.
//!
//! Answers are cached per session with a TTL in a small JSON file so that
//! successive hook processes share them. Losing the file is harmless.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tether_common::ensure_private_dir;
use tether_relay::RelayApi;
use tracing::{debug, warn};

pub const MUTE_CACHE_FILE: &str = "mute-cache.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
struct CacheEntry {
    muted: bool,
    /// Unix millis of the relay answer.
    checked_at: i64,
}

pub struct MuteGate {
    relay: Arc<dyn RelayApi>,
    cache_path: PathBuf,
    ttl: Duration,
}

impl MuteGate {
    pub fn new(relay: Arc<dyn RelayApi>, state_dir: &Path, ttl: Duration) -> Self {
        Self {
            relay,
            cache_path: state_dir.join(MUTE_CACHE_FILE),
            ttl,
        }
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Fresh cache hit, else ask the relay. A failed lookup reads as not
    /// muted and is not cached.
    pub async fn is_muted(&self, session_id: &str) -> bool {
        let mut cache = load_cache(&self.cache_path);
        let now = Utc::now().timestamp_millis();

        if let Some(entry) = cache.get(session_id) {
            let age = now.saturating_sub(entry.checked_at);
            if age >= 0 && (age as u128) < self.ttl.as_millis() {
                debug!(session_id, muted = entry.muted, "mute cache hit");
                return entry.muted;
            }
        }

        match self.relay.mute_status(session_id).await {
            Ok(muted) => {
                cache.insert(
                    session_id.to_string(),
                    CacheEntry {
                        muted,
                        checked_at: now,
                    },
                );
                if let Err(err) = store_cache(&self.cache_path, &cache) {
                    warn!(error = %err, "failed to persist mute cache");
                }
                muted
            }
            Err(err) => {
                warn!(session_id, error = %err, "mute check failed, not muting");
                false
            }
        }
    }

    pub fn clear_mute_cache(&self, session_id: &str) -> Result<()> {
        clear_cached(&self.cache_path, session_id)
    }

    /// Drop one entry without a relay at hand. Returns whether it existed.
    pub fn clear_in(state_dir: &Path, session_id: &str) -> Result<bool> {
        let path = state_dir.join(MUTE_CACHE_FILE);
        let existed = load_cache(&path).contains_key(session_id);
        clear_cached(&path, session_id)?;
        Ok(existed)
    }
}

fn clear_cached(path: &Path, session_id: &str) -> Result<()> {
    let mut cache = load_cache(path);
    if cache.remove(session_id).is_some() {
        store_cache(path, &cache)?;
    }
    Ok(())
}

fn load_cache(path: &Path) -> HashMap<String, CacheEntry> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
            debug!(error = %err, "discarding unreadable mute cache");
            HashMap::new()
        }),
        Err(_) => HashMap::new(),
    }
}

fn store_cache(path: &Path, cache: &HashMap<String, CacheEntry>) -> Result<()> {
    if let Some(dir) = path.parent() {
        ensure_private_dir(dir)
            .with_context(|| format!("refusing mute cache directory {}", dir.display()))?;
    }
    let tmp = path.with_extension(format!("json.{}", std::process::id()));
    let bytes = serde_json::to_vec(cache)?;

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(&tmp)
        .with_context(|| format!("failed to open {}", tmp.display()))?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_relay::{MemoryRelay, Op};
    use tempfile::TempDir;

    const SESSION: &str = "12345678-1234-1234-1234-123456789012";

    #[tokio::test]
    async fn cached_value_served_until_cleared() {
        let dir = TempDir::new().unwrap();
        let relay = Arc::new(MemoryRelay::new());
        relay.set_muted(SESSION, true);
        let gate = MuteGate::new(relay.clone(), dir.path(), Duration::from_secs(60));

        assert!(gate.is_muted(SESSION).await);
        relay.set_muted(SESSION, false);
        assert!(gate.is_muted(SESSION).await);
        assert_eq!(relay.calls(Op::Mute), 1);

        gate.clear_mute_cache(SESSION).unwrap();
        assert!(!gate.is_muted(SESSION).await);
        assert_eq!(relay.calls(Op::Mute), 2);
    }

    #[tokio::test]
    async fn expired_entry_is_refetched() {
        let dir = TempDir::new().unwrap();
        let relay = Arc::new(MemoryRelay::new());
        relay.set_muted(SESSION, true);
        let gate = MuteGate::new(relay.clone(), dir.path(), Duration::from_millis(20));

        assert!(gate.is_muted(SESSION).await);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(gate.is_muted(SESSION).await);
        assert_eq!(relay.calls(Op::Mute), 2);
    }

    #[tokio::test]
    async fn cache_is_shared_across_gates() {
        let dir = TempDir::new().unwrap();
        let relay = Arc::new(MemoryRelay::new());
        relay.set_muted(SESSION, true);

        let first = MuteGate::new(relay.clone(), dir.path(), Duration::from_secs(60));
        assert!(first.is_muted(SESSION).await);
        let second = MuteGate::new(relay.clone(), dir.path(), Duration::from_secs(60));
        assert!(second.is_muted(SESSION).await);
        assert_eq!(relay.calls(Op::Mute), 1);
    }

    #[tokio::test]
    async fn failure_fails_open_and_is_not_cached() {
        let dir = TempDir::new().unwrap();
        let relay = Arc::new(MemoryRelay::new());
        relay.set_muted(SESSION, true);
        relay.fail_next(Op::Mute, 1);
        let gate = MuteGate::new(relay.clone(), dir.path(), Duration::from_secs(60));

        assert!(!gate.is_muted(SESSION).await);
        assert!(gate.is_muted(SESSION).await);
        assert_eq!(relay.calls(Op::Mute), 2);
    }

    #[tokio::test]
    async fn corrupt_cache_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(MUTE_CACHE_FILE), b"{not json").unwrap();
        let relay = Arc::new(MemoryRelay::new());
        let gate = MuteGate::new(relay.clone(), dir.path(), Duration::from_secs(60));

        assert!(!gate.is_muted(SESSION).await);
        assert_eq!(relay.calls(Op::Mute), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shared_directory_is_not_written() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let shared = dir.path().join("shared");
        fs::create_dir(&shared).unwrap();
        fs::set_permissions(&shared, fs::Permissions::from_mode(0o777)).unwrap();
        let victim = dir.path().join("victim");
        fs::write(&victim, b"keep").unwrap();
        std::os::unix::fs::symlink(&victim, shared.join(MUTE_CACHE_FILE)).unwrap();

        let relay = Arc::new(MemoryRelay::new());
        relay.set_muted(SESSION, true);
        let gate = MuteGate::new(relay.clone(), &shared, Duration::from_secs(60));

        assert!(gate.is_muted(SESSION).await);
        assert_eq!(fs::read(&victim).unwrap(), b"keep");
        assert!(fs::symlink_metadata(shared.join(MUTE_CACHE_FILE))
            .unwrap()
            .file_type()
            .is_symlink());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cache_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let relay = Arc::new(MemoryRelay::new());
        let gate = MuteGate::new(relay, dir.path(), Duration::from_secs(60));
        gate.is_muted(SESSION).await;

        let mode = fs::metadata(gate.cache_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
