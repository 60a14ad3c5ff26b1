// Liveness markers for heartbeat reporters.
//
// One marker file per session acts as a soft mutex: a reporter only starts
// when it manages to create the marker, and removes it on every clean exit.
// A marker left behind by a killed reporter blocks new reporters until it
// is cleared; that window is accepted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::ensure_private_dir;

#[cfg(target_family = "unix")]
use std::os::unix::fs::OpenOptionsExt;

/// Contents of a marker file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Marker {
    pub pid: u32,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
}

impl Marker {
    pub fn for_current_process(session_id: &str) -> Self {
        Self {
            pid: std::process::id(),
            session_id: session_id.to_string(),
            started_at: Utc::now(),
        }
    }
}

/// Soft mutual exclusion for one reporter per session.
pub trait LivenessRegistry: Send + Sync {
    /// Claim the session for `marker.pid`. `Ok(false)` when already held.
    fn try_acquire(&self, marker: &Marker) -> io::Result<bool>;

    /// Drop the claim. Releasing an unheld session is a no-op.
    fn release(&self, session_id: &str) -> io::Result<()>;

    /// Current holder, if any.
    fn holder(&self, session_id: &str) -> io::Result<Option<Marker>>;
}

/// Marker files under a private state directory.
#[derive(Debug, Clone)]
pub struct MarkerFileRegistry {
    dir: PathBuf,
}

impl MarkerFileRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn marker_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("heartbeat-{session_id}.json"))
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join("liveness.lock")
    }

    fn ensure_dir(&self) -> io::Result<()> {
        ensure_private_dir(&self.dir)
    }

    fn create_marker_file(&self, path: &Path) -> io::Result<File> {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(target_family = "unix")]
        options.mode(0o600);
        options.open(path)
    }
}

impl LivenessRegistry for MarkerFileRegistry {
    fn try_acquire(&self, marker: &Marker) -> io::Result<bool> {
        self.ensure_dir()?;

        let lock = File::create(self.lock_path())?;
        use fs2::FileExt;
        lock.lock_exclusive()?;

        let path = self.marker_path(&marker.session_id);
        let mut file = match self.create_marker_file(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => return Err(err),
        };

        let body = serde_json::to_vec_pretty(marker)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        if let Err(err) = file.write_all(&body).and_then(|_| file.sync_all()) {
            drop(file);
            let _ = std::fs::remove_file(&path);
            return Err(err);
        }

        drop(lock);
        Ok(true)
    }

    fn release(&self, session_id: &str) -> io::Result<()> {
        match std::fs::remove_file(self.marker_path(session_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn holder(&self, session_id: &str) -> io::Result<Option<Marker>> {
        let path = self.marker_path(session_id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        let marker: Marker = serde_json::from_reader(file).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to parse marker {}: {}", path.display(), e),
            )
        })?;
        Ok(Some(marker))
    }
}

/// In-process registry for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    held: Mutex<HashMap<String, Marker>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> io::Result<std::sync::MutexGuard<'_, HashMap<String, Marker>>> {
        self.held
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "liveness registry poisoned"))
    }
}

impl LivenessRegistry for MemoryRegistry {
    fn try_acquire(&self, marker: &Marker) -> io::Result<bool> {
        let mut held = self.held()?;
        if held.contains_key(&marker.session_id) {
            return Ok(false);
        }
        held.insert(marker.session_id.clone(), marker.clone());
        Ok(true)
    }

    fn release(&self, session_id: &str) -> io::Result<()> {
        self.held()?.remove(session_id);
        Ok(())
    }

    fn holder(&self, session_id: &str) -> io::Result<Option<Marker>> {
        Ok(self.held()?.get(session_id).cloned())
    }
}
