use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use floe_types::{BagId, FloeError, Result, RunId};

use crate::branch::BranchAction;
use crate::inventory::{AtomRef, Inventory};
use crate::ledger::LedgerEntry;
use crate::pricing::{deletion_impact, DeletionImpact};

use super::util::{with_inventory_lock, ArchiveContext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetTarget {
    Bags(Vec<BagId>),
    /// Branch path or name.
    Branch(String),
}

#[derive(Debug, Clone)]
pub struct ResetOptions {
    pub target: ResetTarget,
    /// Drop the affected atoms (or the whole branch) from the inventory
    /// instead of queueing them for re-upload.
    pub forget: bool,
    /// Delete bags still inside the minimum retention period.
    pub allow_early_delete: bool,
    pub dry_run: bool,
}

/// One bag slated for deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedDeletion {
    pub id: BagId,
    pub key: String,
    pub manifest_key: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
    pub encrypted: bool,
}

/// Everything a reset would do, shown before asking for confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResetPlan {
    pub bags: Vec<PlannedDeletion>,
    pub atoms: Vec<AtomRef>,
    pub impact: DeletionImpact,
    /// Bags inside the minimum retention period.
    pub young: Vec<BagId>,
    /// Branch record removed entirely (`--forget` on a branch).
    pub forget_branch: Option<String>,
}

impl ResetPlan {
    pub fn is_empty(&self) -> bool {
        self.bags.is_empty() && self.atoms.is_empty() && self.forget_branch.is_none()
    }

    pub fn encrypted_bags(&self) -> usize {
        self.bags.iter().filter(|b| b.encrypted).count()
    }
}

#[derive(Debug, Clone)]
pub struct ResetOutcome {
    pub run_id: RunId,
    pub plan: ResetPlan,
    /// False when the confirmation callback declined.
    pub applied: bool,
    pub transfers: Vec<LedgerEntry>,
}

/// Work out what a reset would delete and requeue.
pub fn plan(
    ctx: &ArchiveContext,
    inventory: &Inventory,
    target: &ResetTarget,
    forget: bool,
    now: DateTime<Utc>,
) -> Result<ResetPlan> {
    let action = if forget {
        BranchAction::Delete
    } else {
        BranchAction::Reset
    };

    let (ids, atoms, forget_branch): (BTreeSet<BagId>, BTreeSet<AtomRef>, Option<String>) = match target {
        ResetTarget::Bags(ids) => {
            let mut atoms = BTreeSet::new();
            for id in ids {
                let bag = inventory
                    .bags
                    .get(id)
                    .ok_or_else(|| FloeError::NotFound(format!("{id} is not a live bag")))?;
                if let Some(branch) = ctx.branch_for(&bag.branch) {
                    branch.check_permitted(action)?;
                }
                atoms.extend(inventory.atoms_in_bag(*id));
            }
            (ids.iter().copied().collect(), atoms, None)
        }
        ResetTarget::Branch(selector) => {
            let key = resolve_branch_key(ctx, inventory, selector)?;
            if let Some(branch) = ctx.branch_for(&key) {
                branch.check_permitted(action)?;
            }
            let record = inventory.branches.get(&key);
            let atoms: BTreeSet<AtomRef> = record
                .map(|r| {
                    r.atoms
                        .keys()
                        .map(|p| AtomRef {
                            branch: key.clone(),
                            logical_path: p.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            let ids = inventory
                .bags
                .values()
                .filter(|b| b.branch == key)
                .map(|b| b.id)
                .collect();
            (ids, atoms, forget.then_some(key))
        }
    };

    let pricing = ctx.pricing();
    let bags: Vec<PlannedDeletion> = ids
        .iter()
        .filter_map(|id| inventory.bags.get(id))
        .map(|b| PlannedDeletion {
            id: b.id,
            key: b.remote_key.clone(),
            manifest_key: b.manifest_key.clone(),
            size: b.size,
            uploaded_at: b.uploaded_at,
            encrypted: b.encrypted,
        })
        .collect();
    let young = bags
        .iter()
        .filter(|b| pricing.days_remaining(b.uploaded_at, now) > 0)
        .map(|b| b.id)
        .collect();

    Ok(ResetPlan {
        impact: deletion_impact(inventory, &pricing, ids.iter().copied(), now),
        bags,
        atoms: atoms.into_iter().collect(),
        young,
        forget_branch,
    })
}

/// Inventory key for a selector: a configured branch, or a branch that only
/// survives in the inventory.
fn resolve_branch_key(ctx: &ArchiveContext, inventory: &Inventory, selector: &str) -> Result<String> {
    if let Ok(branch) = ctx.find_branch(selector) {
        return Ok(branch.path.clone());
    }
    let wanted = selector.trim_end_matches('/');
    inventory
        .branches
        .keys()
        .find(|k| k.trim_end_matches('/') == wanted)
        .cloned()
        .ok_or_else(|| FloeError::NotFound(format!("no branch matches '{selector}'")))
}

/// Delete the targeted bags and requeue (or forget) their atoms.
///
/// `confirm` sees the plan before anything changes and may decline. Young
/// bags without `allow_early_delete` are refused before any object call.
pub fn run(
    ctx: &ArchiveContext,
    opts: &ResetOptions,
    confirm: impl FnOnce(&ResetPlan) -> bool,
) -> Result<ResetOutcome> {
    let run = RunId::generate();
    let now = Utc::now();
    let ledger = ctx.ledger(run, opts.dry_run);
    let tc = ctx.coordinator(ledger.clone());

    let (plan, applied) = with_inventory_lock(ctx, |store| {
        let mut work = store.load()?;
        let plan = plan(ctx, &work, &opts.target, opts.forget, now)?;

        if !plan.young.is_empty() && !opts.allow_early_delete {
            let names: Vec<String> = plan.young.iter().map(|id| id.to_string()).collect();
            return Err(FloeError::PolicyViolation(format!(
                "{} younger than the minimum retention of {} days; \
                 pass --allow-early-delete to accept a penalty of {:.2} {}",
                names.join(", "),
                ctx.config.archive.min_retention_days,
                plan.impact.penalty,
                ctx.pricing().currency()
            )));
        }
        if plan.is_empty() {
            info!("nothing to reset");
            return Ok((plan, false));
        }
        if !confirm(&plan) {
            info!("reset declined");
            return Ok((plan, false));
        }

        // A failed delete stops the run, but bags already gone are retired
        // and committed so the inventory never points at missing objects.
        let manifests = ctx.manifests();
        let mut failure = None;
        let mut touched = BTreeSet::new();
        for bag in &plan.bags {
            if let Err(e) = tc.delete_bag(&bag.key, bag.size, bag.uploaded_at, now, opts.allow_early_delete) {
                failure = Some(e);
                break;
            }
            touched.extend(work.atoms_in_bag(bag.id));
            work.retire(bag.id);
            let cleanup = tc.delete_object(&bag.manifest_key, 0).and_then(|()| {
                if opts.dry_run {
                    Ok(())
                } else {
                    manifests.remove(&bag.key)
                }
            });
            if let Err(e) = cleanup {
                failure = Some(e);
                break;
            }
        }

        let atoms: Vec<&AtomRef> = match &failure {
            None => plan.atoms.iter().collect(),
            Some(_) => plan.atoms.iter().filter(|a| touched.contains(*a)).collect(),
        };
        for atom in atoms {
            if opts.forget {
                if let Some(branch) = work.branches.get_mut(&atom.branch) {
                    branch.atoms.remove(&atom.logical_path);
                }
            } else if let Some(rec) = work.atom_mut(&atom.branch, &atom.logical_path) {
                rec.bags.clear();
                rec.last_upload = None;
            }
        }
        if let (None, Some(key)) = (&failure, &plan.forget_branch) {
            work.branches.remove(key);
        }

        // Sibling fragment bags of a requeued atom lose their last reference.
        for id in work.sweep_unreferenced(now) {
            warn!(bag = %id, "bag no longer referenced after reset; prune will remove it");
        }

        if opts.dry_run {
            info!("dry run: inventory not committed");
        } else {
            work.updated_at = Some(now);
            store.commit(&work)?;
        }
        if let Some(e) = failure {
            warn!("reset stopped early; bags deleted so far are committed");
            return Err(e);
        }
        Ok((plan, true))
    })?;

    Ok(ResetOutcome {
        run_id: run,
        plan,
        applied,
        transfers: ledger.entries(),
    })
}
