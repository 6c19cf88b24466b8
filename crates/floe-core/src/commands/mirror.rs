use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use floe_storage::StorageClass;
use floe_types::{BagId, Result, RunId};

use crate::branch::{Branch, BranchAction};
use crate::inventory::Inventory;
use crate::keys::KeyLayout;
use crate::ledger::LedgerEntry;
use crate::packer::PackItem;
use crate::scan::{ScanOutcome, ScannedAtom};
use crate::transfer::TransferCoordinator;

use super::stage::{scan_mounted, ship};
use super::util::{is_due, with_inventory_lock, ArchiveContext};

#[derive(Debug, Clone, Default)]
pub struct MirrorOptions {
    /// Restrict the run to one branch (path or name).
    pub branch: Option<String>,
    /// Skip branches whose scan interval has not elapsed.
    pub due_only: bool,
    pub dry_run: bool,
}

/// What happened to one branch.
#[derive(Debug, Clone, Default)]
pub struct BranchSummary {
    pub branch: String,
    pub new: usize,
    pub dirty: usize,
    pub unchanged: usize,
    /// Atoms that could not be read, with the reason.
    pub errored: Vec<(String, String)>,
    /// Atoms gone from disk and dropped from the inventory.
    pub removed: Vec<String>,
    /// Changed atoms left in place because they are pinned.
    pub held: Vec<String>,
    pub bags_uploaded: usize,
    pub bytes_uploaded: u64,
    /// Bags no atom references any more; pruned once old enough.
    pub superseded: Vec<BagId>,
    /// Set when the branch was not processed.
    pub skipped: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MirrorReport {
    pub run_id: RunId,
    pub dry_run: bool,
    pub branches: Vec<BranchSummary>,
    pub transfers: Vec<LedgerEntry>,
}

impl MirrorReport {
    pub fn bags_uploaded(&self) -> usize {
        self.branches.iter().map(|b| b.bags_uploaded).sum()
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.branches.iter().map(|b| b.bytes_uploaded).sum()
    }
}

/// Scan, pack and upload changed atoms, then commit the inventory.
///
/// Nothing is committed unless every upload succeeded. In a dry run no bag
/// is built, no object call is made and the inventory file is untouched.
pub fn run(ctx: &ArchiveContext, opts: &MirrorOptions) -> Result<MirrorReport> {
    let run = RunId::generate();
    let now = Utc::now();
    let ledger = ctx.ledger(run, opts.dry_run);
    let tc = ctx.coordinator(ledger.clone());
    let layout = KeyLayout::new(&ctx.config.remote, &ctx.host, now);
    let branches = ctx.branches_for(opts.branch.as_deref(), BranchAction::Mirror)?;
    let explicit = opts.branch.is_some();

    info!(
        run = %run,
        dry_run = opts.dry_run,
        branches = branches.len(),
        "mirror started"
    );

    let summaries = with_inventory_lock(ctx, |store| {
        let mut work = store.load()?;
        let scratch = if opts.dry_run {
            None
        } else {
            Some(ctx.scratch_dir(run)?)
        };

        let mut summaries = Vec::with_capacity(branches.len());
        for branch in &branches {
            tc.check_interrupted()?;
            if opts.due_only && !is_due(branch, work.branches.get(&branch.path), now) {
                info!(branch = %branch.path, "not due; skipping");
                summaries.push(BranchSummary {
                    branch: branch.path.clone(),
                    skipped: Some("not due".into()),
                    ..Default::default()
                });
                continue;
            }
            let summary = mirror_branch(
                ctx,
                &tc,
                &layout,
                run,
                branch,
                &mut work,
                scratch.as_ref().map(|d| d.path()),
                explicit,
                now,
            )?;
            summaries.push(summary);
        }

        if opts.dry_run {
            info!("dry run: inventory not committed");
            return Ok(summaries);
        }
        work.updated_at = Some(now);
        store.commit(&work)?;
        publish_system_artifacts(ctx, &tc, &layout, &work)?;
        Ok(summaries)
    })?;

    let report = MirrorReport {
        run_id: run,
        dry_run: opts.dry_run,
        branches: summaries,
        transfers: ledger.entries(),
    };
    info!(
        run = %run,
        bags = report.bags_uploaded(),
        bytes = report.bytes_uploaded(),
        "mirror finished"
    );
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
fn mirror_branch(
    ctx: &ArchiveContext,
    tc: &TransferCoordinator,
    layout: &KeyLayout,
    run: RunId,
    branch: &Branch,
    work: &mut Inventory,
    scratch: Option<&Path>,
    explicit: bool,
    now: DateTime<Utc>,
) -> Result<BranchSummary> {
    let mut summary = BranchSummary {
        branch: branch.path.clone(),
        ..Default::default()
    };

    let (guard, scan) = match scan_mounted(ctx, branch, work) {
        Ok(scanned) => scanned,
        Err(e) if !explicit && !matches!(e, floe_types::FloeError::Interrupted) => {
            warn!(branch = %branch.path, "skipping branch: {e}");
            summary.skipped = Some(e.to_string());
            return Ok(summary);
        }
        Err(e) => return Err(e),
    };

    summary.new = scan.count(|o| *o == ScanOutcome::New);
    summary.dirty = scan.count(|o| *o == ScanOutcome::Dirty);
    summary.unchanged = scan.count(|o| *o == ScanOutcome::Unchanged);
    summary.errored = scan
        .errored()
        .map(|a| match &a.outcome {
            ScanOutcome::Errored(reason) => (a.source.logical_path.clone(), reason.clone()),
            _ => (a.source.logical_path.clone(), String::new()),
        })
        .collect();

    let atoms: BTreeMap<String, &ScannedAtom> = scan
        .atoms
        .iter()
        .map(|a| (a.source.logical_path.clone(), a))
        .collect();
    let items: Vec<PackItem> = scan
        .atoms
        .iter()
        .filter(|a| a.outcome.needs_packing())
        .map(|a| PackItem::new(&branch.path, &a.source.logical_path, a.size))
        .collect();

    let plan = ctx.packer()?.pack_incremental(branch, items, work)?;
    summary.held = plan.held.clone();

    for (id, bag) in work.bags.iter().filter(|(_, b)| b.branch == branch.path) {
        if !plan.obsolete.contains(id) {
            tc.keep(&bag.remote_key, bag.size, "unchanged");
        }
    }

    let shipped = ship(
        ctx,
        tc,
        layout,
        run,
        branch,
        work,
        &plan.bins,
        false,
        &atoms,
        scratch,
        now,
    )?;
    drop(guard);
    summary.bags_uploaded = shipped.bags;
    summary.bytes_uploaded = shipped.bytes;

    let record = work.branches.entry(branch.path.clone()).or_default();
    for path in &scan.removed {
        if record.atoms.get(path).is_some_and(|a| a.pinned) {
            warn!(atom = %path, "pinned atom vanished from disk; keeping its record");
            continue;
        }
        info!(atom = %path, "atom removed from disk");
        record.atoms.remove(path);
        summary.removed.push(path.clone());
    }
    record.tags = branch.describe_tags();
    record.last_scan = Some(now);

    summary.superseded = work.sweep_unreferenced(now);
    for id in &summary.superseded {
        if let Some(bag) = work.superseded.get(id) {
            info!(bag = %id, key = %bag.remote_key, "bag superseded");
        }
    }
    Ok(summary)
}

/// Copies of the inventory and branch list beside the bags, in the standard
/// class. The config itself is not uploaded since it may hold secrets.
fn publish_system_artifacts(
    ctx: &ArchiveContext,
    tc: &TransferCoordinator,
    layout: &KeyLayout,
    inventory: &Inventory,
) -> Result<()> {
    let json = serde_json::to_vec_pretty(inventory)?;
    tc.put_small(&layout.system_key("inventory.json"), &json, &StorageClass::Standard)?;

    let mut listing = String::new();
    for branch in &ctx.branches {
        listing.push_str(&format!("{} :: {}\n", branch.path, branch.describe_tags()));
    }
    tc.put_small(&layout.system_key("branches.txt"), listing.as_bytes(), &StorageClass::Standard)?;
    Ok(())
}
