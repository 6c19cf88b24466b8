use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{info, warn};

use floe_types::{BagId, FloeError, Result, RunId};

use crate::branch::BranchAction;
use crate::keys::KeyLayout;
use crate::ledger::LedgerEntry;
use crate::packer::{PackItem, PlannedBin};
use crate::pricing::deletion_impact;
use crate::scan::{ScanOutcome, ScannedAtom};

use super::stage::{scan_mounted, ship};
use super::util::{with_inventory_lock, ArchiveContext};

#[derive(Debug, Clone, Default)]
pub struct RepackOptions {
    pub branch: Option<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RepackBranch {
    pub branch: String,
    pub bags_before: usize,
    pub bags_after: usize,
    pub bags_uploaded: usize,
    pub bytes_uploaded: u64,
    /// Bags left untouched because their content already matched.
    pub reused: Vec<BagId>,
    pub superseded: Vec<BagId>,
    /// Early-deletion penalty the superseded bags will incur if pruned now.
    pub penalty: f64,
    pub held: Vec<String>,
    pub skipped: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RepackReport {
    pub run_id: RunId,
    pub dry_run: bool,
    pub branches: Vec<RepackBranch>,
    pub transfers: Vec<LedgerEntry>,
}

/// Re-pool every atom of each branch into fresh bags, reusing retired ids.
/// Replaced bags become superseded and are removed by a later prune.
pub fn run(ctx: &ArchiveContext, opts: &RepackOptions) -> Result<RepackReport> {
    let run = RunId::generate();
    let now = Utc::now();
    let ledger = ctx.ledger(run, opts.dry_run);
    let tc = ctx.coordinator(ledger.clone());
    let layout = KeyLayout::new(&ctx.config.remote, &ctx.host, now);
    let branches = ctx.branches_for(opts.branch.as_deref(), BranchAction::Repack)?;
    let pricing = ctx.pricing();

    let results = with_inventory_lock(ctx, |store| {
        let mut work = store.load()?;
        let scratch = if opts.dry_run {
            None
        } else {
            Some(ctx.scratch_dir(run)?)
        };
        let mut results = Vec::with_capacity(branches.len());

        for branch in &branches {
            tc.check_interrupted()?;
            let mut summary = RepackBranch {
                branch: branch.path.clone(),
                bags_before: work.bags.values().filter(|b| b.branch == branch.path).count(),
                ..Default::default()
            };

            let (guard, scan) = match scan_mounted(ctx, branch, &work) {
                Ok(s) => s,
                Err(e) if opts.branch.is_none() && !matches!(e, FloeError::Interrupted) => {
                    warn!(branch = %branch.path, "skipping branch: {e}");
                    summary.skipped = Some(e.to_string());
                    results.push(summary);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let atoms: BTreeMap<String, &ScannedAtom> = scan
                .atoms
                .iter()
                .map(|a| (a.source.logical_path.clone(), a))
                .collect();
            // Unreadable atoms keep their bags.
            let items: Vec<PackItem> = scan
                .atoms
                .iter()
                .filter(|a| !matches!(a.outcome, ScanOutcome::Errored(_)))
                .map(|a| PackItem::new(&branch.path, &a.source.logical_path, a.size))
                .collect();

            let mut plan = ctx.packer()?.pack_repack(branch, items, &work)?;
            // A matching bag holding stale content still has to be rebuilt.
            for bin in &mut plan.bins {
                let stale = bin
                    .atoms
                    .iter()
                    .any(|p| atoms.get(p).is_some_and(|a| a.outcome.needs_packing()));
                if stale {
                    bin.reuse = None;
                }
            }
            summary.held = plan.held.clone();
            summary.reused = plan.bins.iter().filter_map(|b| b.reuse).collect();
            for id in &summary.reused {
                if let Some(bag) = work.bags.get(id) {
                    tc.keep(&bag.remote_key, bag.size, "already packed");
                }
            }

            let fresh: Vec<PlannedBin> = plan.bins.iter().filter(|b| b.needs_upload()).cloned().collect();
            let shipped = ship(
                ctx,
                &tc,
                &layout,
                run,
                branch,
                &mut work,
                &fresh,
                true,
                &atoms,
                scratch.as_ref().map(|d| d.path()),
                now,
            )?;
            drop(guard);
            summary.bags_uploaded = shipped.bags;
            summary.bytes_uploaded = shipped.bytes;

            summary.superseded = work.sweep_unreferenced(now);
            summary.penalty = deletion_impact(&work, &pricing, summary.superseded.iter().copied(), now).penalty;
            summary.bags_after = work.bags.values().filter(|b| b.branch == branch.path).count();
            info!(
                branch = %branch.path,
                before = summary.bags_before,
                after = summary.bags_after,
                "branch repacked"
            );
            results.push(summary);
        }

        if opts.dry_run {
            info!("dry run: inventory not committed");
        } else {
            work.updated_at = Some(now);
            store.commit(&work)?;
        }
        Ok(results)
    })?;

    Ok(RepackReport {
        run_id: run,
        dry_run: opts.dry_run,
        branches: results,
        transfers: ledger.entries(),
    })
}
