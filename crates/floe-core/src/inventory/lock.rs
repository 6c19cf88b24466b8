use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use floe_types::{FloeError, Result};

const DEFAULT_STALE_LOCK_SECS: i64 = 6 * 60 * 60; // 6 hours

/// Contents of `<inventory>.lock`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEntry {
    pub hostname: String,
    pub pid: u32,
    pub time: String,
}

impl LockEntry {
    fn acquired_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.time)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Exclusive hold on the inventory for a live run. Released on drop.
#[derive(Debug)]
pub struct InventoryLock {
    path: PathBuf,
    released: bool,
}

pub fn lock_path(inventory_file: &Path) -> PathBuf {
    let mut name = inventory_file
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    inventory_file.with_file_name(name)
}

impl InventoryLock {
    pub fn acquire(inventory_file: &Path) -> Result<Self> {
        Self::acquire_with_stale_after(inventory_file, Duration::seconds(DEFAULT_STALE_LOCK_SECS))
    }

    pub fn acquire_with_stale_after(inventory_file: &Path, stale_after: Duration) -> Result<Self> {
        let path = lock_path(inventory_file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if let Some(existing) = read_entry(&path) {
            let stale = existing
                .acquired_at()
                .map(|t| Utc::now() - t > stale_after)
                .unwrap_or(true);
            if stale {
                warn!(
                    "removing stale inventory lock held by {}:{} since {}",
                    existing.hostname, existing.pid, existing.time
                );
                let _ = std::fs::remove_file(&path);
            }
        }

        let entry = LockEntry {
            hostname: crate::platform::hostname(),
            pid: crate::platform::pid(),
            time: Utc::now().to_rfc3339(),
        };
        let data = serde_json::to_vec(&entry)?;

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(&data)?;
                file.sync_all()?;
                debug!(path = %path.display(), "inventory lock acquired");
                Ok(Self {
                    path,
                    released: false,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = read_entry(&path)
                    .map(|h| format!("{}:{} since {}", h.hostname, h.pid, h.time))
                    .unwrap_or_else(|| "unknown".to_string());
                Err(FloeError::Locked(holder))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for InventoryLock {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to release inventory lock: {e}");
                }
            }
        }
    }
}

fn read_entry(path: &Path) -> Option<LockEntry> {
    let data = std::fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
}

/// Forcibly remove the inventory lock. Returns whether one existed.
pub fn break_lock(inventory_file: &Path) -> Result<bool> {
    let path = lock_path(inventory_file);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
