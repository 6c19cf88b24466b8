use chrono::Utc;
use tracing::{info, warn};

use floe_types::{BagId, Result, RunId};

use crate::keys::{is_bag_key, manifest_key_for};
use crate::ledger::LedgerEntry;

use super::util::{with_inventory_lock, ArchiveContext};

#[derive(Debug, Clone, PartialEq)]
pub struct PrunedBag {
    pub key: String,
    pub size: u64,
    pub age_days: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct YoungOrphan {
    pub key: String,
    pub size: u64,
    pub days_left: i64,
}

#[derive(Debug, Clone)]
pub struct PruneReport {
    pub run_id: RunId,
    pub dry_run: bool,
    pub deleted: Vec<PrunedBag>,
    /// Orphans still inside the minimum retention period.
    pub skipped_young: Vec<YoungOrphan>,
    /// Superseded records whose object was already gone.
    pub forgotten: Vec<BagId>,
    pub transfers: Vec<LedgerEntry>,
}

impl PruneReport {
    pub fn freed_bytes(&self) -> u64 {
        self.deleted.iter().map(|b| b.size).sum()
    }
}

/// Delete remote bags the inventory no longer references, once they have
/// cleared the minimum retention period. Age comes from the object
/// service's own timestamp. Listing happens in dry runs too; nothing is
/// deleted or committed.
pub fn run(ctx: &ArchiveContext, dry_run: bool) -> Result<PruneReport> {
    let run = RunId::generate();
    let now = Utc::now();
    let ledger = ctx.ledger(run, dry_run);
    let tc = ctx.coordinator(ledger.clone());
    let manifests = ctx.manifests();

    let (deleted, skipped_young, forgotten) = with_inventory_lock(ctx, |store| {
        let mut work = store.load()?;
        let live = work.live_keys();
        let listed = tc.list(&ctx.config.remote.listing_prefix())?;

        let mut deleted = Vec::new();
        let mut skipped = Vec::new();
        for obj in listed.iter().filter(|o| is_bag_key(&o.key)) {
            if live.contains_key(&obj.key) {
                continue;
            }
            tc.check_interrupted()?;
            if let Some(left) = tc.retention_remaining(obj.last_modified, now) {
                let days_left = left.num_days() + 1;
                tc.skip_young(&obj.key, obj.size, days_left);
                skipped.push(YoungOrphan {
                    key: obj.key.clone(),
                    size: obj.size,
                    days_left,
                });
                continue;
            }
            tc.delete_bag(&obj.key, obj.size, obj.last_modified, now, false)?;
            tc.delete_object(&manifest_key_for(&obj.key), 0)?;
            if !dry_run {
                manifests.remove(&obj.key)?;
            }

            let superseded_id = work
                .superseded
                .values()
                .find(|s| s.remote_key == obj.key)
                .map(|s| s.id);
            if let Some(id) = superseded_id {
                work.retire(id);
            }
            deleted.push(PrunedBag {
                key: obj.key.clone(),
                size: obj.size,
                age_days: (now - obj.last_modified).num_days(),
            });
        }

        // Superseded records whose object has already vanished.
        let present: std::collections::BTreeSet<&str> =
            listed.iter().map(|o| o.key.as_str()).collect();
        let vanished: Vec<BagId> = work
            .superseded
            .values()
            .filter(|s| !present.contains(s.remote_key.as_str()))
            .map(|s| s.id)
            .collect();
        for id in &vanished {
            warn!(bag = %id, "superseded bag already absent remotely; retiring");
            work.retire(*id);
        }

        if dry_run {
            info!("dry run: inventory not committed");
        } else if !deleted.is_empty() || !vanished.is_empty() {
            work.updated_at = Some(now);
            store.commit(&work)?;
        }
        Ok((deleted, skipped, vanished))
    })?;

    info!(
        deleted = deleted.len(),
        skipped = skipped_young.len(),
        "prune finished"
    );
    Ok(PruneReport {
        run_id: run,
        dry_run,
        deleted,
        skipped_young,
        forgotten,
        transfers: ledger.entries(),
    })
}
