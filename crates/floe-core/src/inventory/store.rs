use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use floe_types::{FloeError, Result};

use super::{Inventory, INVENTORY_VERSION};

const DEFAULT_KEEP_BACKUPS: usize = 10;

/// Loads and atomically commits the inventory file.
#[derive(Debug, Clone)]
pub struct InventoryStore {
    path: PathBuf,
    backup_dir: PathBuf,
    keep_backups: usize,
}

impl InventoryStore {
    pub fn new(path: PathBuf, backup_dir: PathBuf) -> Self {
        Self {
            path,
            backup_dir,
            keep_backups: DEFAULT_KEEP_BACKUPS,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the inventory, or an empty one when no file exists yet.
    pub fn load(&self) -> Result<Inventory> {
        let data = match std::fs::read(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no inventory yet, starting empty");
                return Ok(Inventory::default());
            }
            Err(e) => return Err(e.into()),
        };
        let inv: Inventory = serde_json::from_slice(&data).map_err(|e| {
            FloeError::Consistency(format!(
                "inventory {} is unreadable: {e}",
                self.path.display()
            ))
        })?;
        if inv.version > INVENTORY_VERSION {
            return Err(FloeError::Consistency(format!(
                "inventory version {} is newer than supported ({INVENTORY_VERSION})",
                inv.version
            )));
        }
        Ok(inv)
    }

    /// Replace the file with `inventory`. The previous file is copied to the
    /// backup directory first; the new one is written via rename.
    pub fn commit(&self, inventory: &Inventory) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        if self.path.exists() {
            self.backup_current()?;
        }

        let mut inv = inventory.clone();
        inv.version = INVENTORY_VERSION;
        inv.updated_at = Some(Utc::now());
        let data = serde_json::to_vec_pretty(&inv)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| FloeError::Io(e.error))?;
        debug!(path = %self.path.display(), "inventory committed");
        Ok(())
    }

    fn backup_current(&self) -> Result<()> {
        std::fs::create_dir_all(&self.backup_dir)?;
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "inventory".into());
        let ts = Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
        let dest = self.backup_dir.join(format!("{stem}-{ts}.json"));
        std::fs::copy(&self.path, &dest)?;
        self.prune_backups(&stem);
        Ok(())
    }

    fn prune_backups(&self, stem: &str) {
        let prefix = format!("{stem}-");
        let mut backups: Vec<PathBuf> = match std::fs::read_dir(&self.backup_dir) {
            Ok(rd) => rd
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with(&prefix) && n.ends_with(".json"))
                        .unwrap_or(false)
                })
                .collect(),
            Err(e) => {
                warn!("cannot list inventory backups: {e}");
                return;
            }
        };
        // Timestamped names sort chronologically.
        backups.sort();
        let excess = backups.len().saturating_sub(self.keep_backups);
        for old in backups.into_iter().take(excess) {
            if let Err(e) = std::fs::remove_file(&old) {
                warn!("cannot remove old inventory backup {}: {e}", old.display());
            }
        }
    }

    pub fn backups(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        match std::fs::read_dir(&self.backup_dir) {
            Ok(rd) => {
                for entry in rd {
                    out.push(entry?.path());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        out.sort();
        Ok(out)
    }
}
