//! Read-only views of the inventory for `show` and `report`.

use chrono::{DateTime, Utc};

use floe_types::{BagId, FloeError, Result};

use crate::inventory::{AtomRecord, BagRecord, Inventory};
use crate::pricing::{cost_report, CostReport};

use super::util::ArchiveContext;

#[derive(Debug, Clone, PartialEq)]
pub struct BranchView {
    pub path: String,
    pub tags: String,
    pub configured: bool,
    pub atoms: usize,
    pub pinned: usize,
    pub pending: usize,
    pub bags: usize,
    pub bytes: u64,
    pub last_scan: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AtomView {
    pub path: String,
    pub record: AtomRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BagView {
    pub record: BagRecord,
    /// Atoms that still reference the bag.
    pub live_atoms: Vec<String>,
    pub dead_bytes: u64,
    pub age_days: i64,
    pub retention_days_left: i64,
    pub early_delete_penalty: f64,
}

/// One row per branch, configured or only remembered by the inventory.
pub fn tree(ctx: &ArchiveContext) -> Result<Vec<BranchView>> {
    let inventory = ctx.inventory_store().load()?;
    let mut rows: Vec<BranchView> = ctx
        .branches
        .iter()
        .map(|b| branch_view(&inventory, &b.path, b.describe_tags(), true))
        .collect();
    for (path, rec) in &inventory.branches {
        if ctx.branch_for(path).is_none() {
            rows.push(branch_view(&inventory, path, rec.tags.clone(), false));
        }
    }
    Ok(rows)
}

fn branch_view(inventory: &Inventory, path: &str, tags: String, configured: bool) -> BranchView {
    let rec = inventory.branches.get(path);
    let atoms = rec.map(|r| r.atoms.len()).unwrap_or(0);
    let pinned = rec.map(|r| r.atoms.values().filter(|a| a.pinned).count()).unwrap_or(0);
    let pending = rec
        .map(|r| r.atoms.values().filter(|a| a.needs_upload()).count())
        .unwrap_or(0);
    let bags: Vec<&BagRecord> = inventory.bags.values().filter(|b| b.branch == path).collect();
    BranchView {
        path: path.to_string(),
        tags,
        configured,
        atoms,
        pinned,
        pending,
        bags: bags.len(),
        bytes: bags.iter().map(|b| b.size).sum(),
        last_scan: rec.and_then(|r| r.last_scan),
    }
}

/// Atoms of one branch.
pub fn branch(ctx: &ArchiveContext, selector: &str) -> Result<Vec<AtomView>> {
    let inventory = ctx.inventory_store().load()?;
    let key = match ctx.find_branch(selector) {
        Ok(b) => b.path.clone(),
        Err(_) => selector.to_string(),
    };
    let rec = inventory
        .branches
        .get(&key)
        .ok_or_else(|| FloeError::NotFound(format!("branch '{selector}' has no inventory record")))?;
    Ok(rec
        .atoms
        .iter()
        .map(|(path, record)| AtomView {
            path: path.clone(),
            record: record.clone(),
        })
        .collect())
}

pub fn bag(ctx: &ArchiveContext, id: BagId) -> Result<BagView> {
    let inventory = ctx.inventory_store().load()?;
    let record = inventory
        .bags
        .get(&id)
        .cloned()
        .ok_or_else(|| FloeError::NotFound(format!("{id} is not a live bag")))?;
    let now = Utc::now();
    let pricing = ctx.pricing();
    Ok(BagView {
        live_atoms: inventory
            .atoms_in_bag(id)
            .into_iter()
            .map(|r| r.logical_path)
            .collect(),
        dead_bytes: inventory.dead_bytes(id),
        age_days: (now - record.uploaded_at).num_days(),
        retention_days_left: pricing.days_remaining(record.uploaded_at, now),
        early_delete_penalty: pricing.early_deletion_penalty(record.size, record.uploaded_at, now),
        record,
    })
}

/// An atom by logical path, searched across branches.
pub fn atom(ctx: &ArchiveContext, path: &str) -> Result<(String, AtomView)> {
    let inventory = ctx.inventory_store().load()?;
    let wanted = path.trim_end_matches('/');
    let found = inventory
        .atoms()
        .find(|(r, _)| r.logical_path == wanted)
        .map(|(r, rec)| {
            (
                r.branch,
                AtomView {
                    path: r.logical_path,
                    record: rec.clone(),
                },
            )
        });
    found.ok_or_else(|| FloeError::NotFound(format!("no atom '{path}' in the inventory")))
}

/// Cost and waste summary.
pub fn report(ctx: &ArchiveContext) -> Result<CostReport> {
    let inventory = ctx.inventory_store().load()?;
    Ok(cost_report(&inventory, &ctx.pricing(), Utc::now()))
}
