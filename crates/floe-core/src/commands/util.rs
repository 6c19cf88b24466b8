use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use floe_storage::{backend_from_config, ObjectStore};
use floe_types::{FloeError, Result, RunId};

use crate::branch::{Branch, BranchAction};
use crate::config::{FloeConfig, ResolvedPaths};
use crate::filter::{FilterSpec, PassphraseKey};
use crate::inventory::{BranchRecord, InventoryLock, InventoryStore};
use crate::ledger::Ledger;
use crate::limits;
use crate::manifest::ManifestDir;
use crate::mount::{Mounter, SshfsMounter};
use crate::packer::Packer;
use crate::pricing::Pricing;
use crate::transfer::TransferCoordinator;

/// Everything a command needs, resolved once from configuration.
pub struct ArchiveContext {
    pub config: FloeConfig,
    pub paths: ResolvedPaths,
    pub branches: Vec<Branch>,
    pub store: Arc<dyn ObjectStore>,
    pub mounter: Arc<dyn Mounter>,
    pub key: Option<Arc<PassphraseKey>>,
    pub host: String,
    pub shutdown: Option<Arc<AtomicBool>>,
}

impl ArchiveContext {
    /// Validate the config and open the configured backend.
    pub fn open(config: FloeConfig, shutdown: Option<Arc<AtomicBool>>) -> Result<Self> {
        config.validate()?;
        let backend: Arc<dyn ObjectStore> = Arc::from(backend_from_config(&config.storage_config())?);
        let store = limits::wrap_store(backend, &config.limits);
        let paths = config.paths.resolve();
        let key = config
            .encryption
            .resolve_passphrase()?
            .map(|p| Arc::new(PassphraseKey::new(p, config.encryption.cipher)));
        let mut ctx = Self::with_parts(config, paths, store, Arc::new(SshfsMounter), key)?;
        ctx.shutdown = shutdown;
        Ok(ctx)
    }

    /// Assemble a context from already-built collaborators.
    pub fn with_parts(
        config: FloeConfig,
        paths: ResolvedPaths,
        store: Arc<dyn ObjectStore>,
        mounter: Arc<dyn Mounter>,
        key: Option<Arc<PassphraseKey>>,
    ) -> Result<Self> {
        let branches = config.branches()?;
        let host = config.hostname();
        Ok(Self {
            config,
            paths,
            branches,
            store,
            mounter,
            key,
            host,
            shutdown: None,
        })
    }

    pub fn inventory_store(&self) -> InventoryStore {
        InventoryStore::new(
            self.paths.inventory_file.clone(),
            self.paths.inventory_backup_dir.clone(),
        )
    }

    pub fn manifests(&self) -> ManifestDir {
        ManifestDir::new(self.paths.manifest_dir.clone())
    }

    pub fn ledger(&self, run: RunId, dry_run: bool) -> Arc<Ledger> {
        Arc::new(Ledger::new(run, dry_run, Some(self.paths.log_dir.clone())))
    }

    pub fn coordinator(&self, ledger: Arc<Ledger>) -> TransferCoordinator {
        TransferCoordinator::new(
            self.store.clone(),
            self.config.remote.retry.clone(),
            ledger,
            self.config.limits.transfer_concurrency,
            self.config.archive.min_retention_days,
        )
        .with_shutdown(self.shutdown.clone())
    }

    pub fn packer(&self) -> Result<Packer> {
        Packer::new(self.config.archive.bag_capacity()?)
    }

    pub fn pricing(&self) -> Pricing {
        Pricing::new(
            self.config.pricing.clone(),
            self.config.archive.min_retention_days,
        )
    }

    pub fn filter_spec(&self, branch: &Branch) -> FilterSpec {
        FilterSpec::for_branch(branch.flags(), &self.config.compression)
    }

    pub fn key(&self) -> Option<&PassphraseKey> {
        self.key.as_deref()
    }

    /// Branch config for an inventory branch key, if still configured.
    pub fn branch_for(&self, path: &str) -> Option<&Branch> {
        self.branches.iter().find(|b| b.path == path)
    }

    /// Resolve a selector to a configured branch.
    pub fn find_branch(&self, selector: &str) -> Result<&Branch> {
        self.branches
            .iter()
            .find(|b| b.matches(selector))
            .ok_or_else(|| FloeError::NotFound(format!("no configured branch matches '{selector}'")))
    }

    /// Branches an action applies to. An explicitly named Locked branch is a
    /// policy violation; Locked branches in a full-tree run are skipped.
    pub fn branches_for(&self, selector: Option<&str>, action: BranchAction) -> Result<Vec<&Branch>> {
        match selector {
            Some(sel) => {
                let branch = self.find_branch(sel)?;
                branch.check_permitted(action)?;
                Ok(vec![branch])
            }
            None => Ok(self
                .branches
                .iter()
                .filter(|b| match b.check_permitted(action) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("skipping: {e}");
                        false
                    }
                })
                .collect()),
        }
    }

    /// Scratch directory for one run, removed on drop.
    pub fn scratch_dir(&self, run: RunId) -> Result<tempfile::TempDir> {
        std::fs::create_dir_all(&self.paths.staging_dir)?;
        Ok(tempfile::Builder::new()
            .prefix(&format!("run-{run}-"))
            .tempdir_in(&self.paths.staging_dir)?)
    }

    pub fn restore_state_file(&self) -> PathBuf {
        self.paths.restore_state_file()
    }
}

/// Run `action` while holding the inventory lock. The lock is released on
/// every exit path.
pub fn with_inventory_lock<T>(
    ctx: &ArchiveContext,
    action: impl FnOnce(&InventoryStore) -> Result<T>,
) -> Result<T> {
    let store = ctx.inventory_store();
    let lock = InventoryLock::acquire(store.path())?;
    let result = action(&store);
    match lock.release() {
        Ok(()) => result,
        Err(release_err) => {
            if result.is_err() {
                warn!("failed to release inventory lock: {release_err}");
                result
            } else {
                Err(release_err)
            }
        }
    }
}

/// Whether a branch is due for another scan.
pub fn is_due(branch: &Branch, record: Option<&BranchRecord>, now: DateTime<Utc>) -> bool {
    let Some(last) = record.and_then(|r| r.last_scan) else {
        return true;
    };
    now - last >= chrono::Duration::days(i64::from(branch.scan_interval_days))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::PackingMode;

    #[test]
    fn due_after_interval() {
        let mut b = Branch::new("/d", PackingMode::Shared).unwrap();
        b.scan_interval_days = 30;
        let now = Utc::now();
        assert!(is_due(&b, None, now));
        let mut rec = BranchRecord {
            last_scan: Some(now - chrono::Duration::days(10)),
            ..Default::default()
        };
        assert!(!is_due(&b, Some(&rec), now));
        rec.last_scan = Some(now - chrono::Duration::days(31));
        assert!(is_due(&b, Some(&rec), now));
    }
}
