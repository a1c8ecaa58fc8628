//! On-disk container records
//!
//! Each container owns a directory `<root>/containers/<id>/` holding
//! `config.json` (this record) and `<id>-json.log` (its output log).

use crate::container::ContainerConfig;
use crate::lifecycle::{Phase, State};
use crate::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use wharf_runtime::ContainerId;

const RECORD_FILE: &str = "config.json";

/// Write content to a file atomically using a temp-file-then-rename pattern.
///
/// A crash during the write leaves the previous file intact.
pub(crate) fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(content)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Run `f` while holding an exclusive lock for `path`.
///
/// The lock lives in a sibling `*.lock` file and is released when the closure
/// returns.
pub(crate) fn with_path_lock<T, F>(path: &Path, f: F) -> std::io::Result<T>
where
    F: FnOnce() -> std::io::Result<T>,
{
    let _lock = acquire_lock(path)?;
    f()
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut lock = path.as_os_str().to_owned();
    lock.push(".lock");
    PathBuf::from(lock)
}

struct PathLockGuard {
    lock_path: PathBuf,
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

fn acquire_lock(path: &Path) -> std::io::Result<PathLockGuard> {
    let lock_path = lock_path_for(path);
    for _ in 0..200 {
        match std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&lock_path)
        {
            Ok(_) => return Ok(PathLockGuard { lock_path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("timed out waiting for lock {}", lock_path.display()),
    ))
}

/// Directory holding every container's files
pub fn containers_dir(root: &Path) -> PathBuf {
    root.join("containers")
}

/// Persisted form of a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: ContainerId,
    pub created: DateTime<Utc>,
    pub config: ContainerConfig,
    pub state: State,
    /// Pid of the engine process supervising the running container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor: Option<u32>,
}

impl ContainerRecord {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(RECORD_FILE)
    }

    /// Save into the container directory `dir`
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let path = Self::path_in(dir);
        let content = serde_json::to_vec_pretty(self)?;
        with_path_lock(&path, || atomic_write(&path, &content))?;
        Ok(())
    }

    /// [`save`](Self::save) off the async runtime; the lock wait may sleep
    pub async fn store(self, dir: PathBuf) -> Result<()> {
        tokio::task::spawn_blocking(move || self.save(&dir))
            .await
            .map_err(|e| CoreError::InvalidState(format!("record save task failed: {}", e)))?
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = Self::path_in(dir);
        let content = std::fs::read(&path)?;
        serde_json::from_slice(&content)
            .map_err(|e| CoreError::StateCorrupted(format!("{}: {}", path.display(), e)))
    }

    /// True when another live engine process supervises this container
    pub fn supervised_elsewhere(&self) -> bool {
        match self.supervisor {
            Some(pid) if pid != std::process::id() => supervisor_alive(pid),
            _ => false,
        }
    }

    /// A record saved while running whose supervisor is gone belongs to a
    /// process that no longer exists
    pub(crate) fn settle_stale(&mut self) -> bool {
        if self.state.phase != Phase::Running && !self.state.running {
            return false;
        }
        if self.supervised_elsewhere() {
            return false;
        }
        self.supervisor = None;
        self.state.phase = Phase::Exited;
        self.state.running = false;
        self.state.pid = None;
        self.state.exit_code = -1;
        self.state.finished_at = Some(Utc::now());
        true
    }
}

#[cfg(unix)]
fn supervisor_alive(pid: u32) -> bool {
    wharf_runtime::process_alive(pid)
}

#[cfg(not(unix))]
fn supervisor_alive(_pid: u32) -> bool {
    false
}

/// Load every readable record under `root`, skipping corrupt ones
pub fn load_records(root: &Path) -> Result<Vec<(PathBuf, ContainerRecord)>> {
    let dir = containers_dir(root);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !ContainerRecord::path_in(&path).exists() {
            continue;
        }
        match ContainerRecord::load(&path) {
            Ok(record) => records.push((path, record)),
            Err(e) => tracing::warn!("Skipping container {}: {}", path.display(), e),
        }
    }
    records.sort_by_key(|(_, r)| r.created);
    Ok(records)
}
