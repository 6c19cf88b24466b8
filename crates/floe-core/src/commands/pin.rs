use chrono::Utc;
use tracing::info;

use floe_types::{FloeError, Result};

use super::util::{with_inventory_lock, ArchiveContext};

/// Pin or unpin an atom. Returns the owning branch key and whether the flag
/// changed. A pinned atom keeps its bags through mirror and repack.
pub fn run(ctx: &ArchiveContext, atom_path: &str, pinned: bool, dry_run: bool) -> Result<(String, bool)> {
    let wanted = atom_path.trim_end_matches('/').to_string();
    with_inventory_lock(ctx, |store| {
        let mut work = store.load()?;
        let branch = work
            .atoms()
            .find(|(r, _)| r.logical_path == wanted)
            .map(|(r, _)| r.branch)
            .ok_or_else(|| FloeError::NotFound(format!("no atom '{atom_path}' in the inventory")))?;
        let rec = work
            .atom_mut(&branch, &wanted)
            .ok_or_else(|| FloeError::NotFound(format!("no atom '{atom_path}' in the inventory")))?;
        if rec.pinned == pinned {
            return Ok((branch, false));
        }
        rec.pinned = pinned;
        if dry_run {
            info!(atom = %wanted, pinned, "dry run: inventory not committed");
        } else {
            work.updated_at = Some(Utc::now());
            store.commit(&work)?;
            info!(atom = %wanted, pinned, "pin updated");
        }
        Ok((branch, true))
    })
}
