use floe_types::{BagId, Result};

use crate::inventory::Inventory;
use crate::keys::bag_stem;

use super::util::ArchiveContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindHit {
    pub path: String,
    pub bag_stem: String,
    pub bag: Option<BagId>,
    /// Branch key, when the bag is still tracked.
    pub branch: Option<String>,
    /// Atom holding the file.
    pub atom: Option<String>,
    /// False when the manifest belongs to a superseded or retired bag.
    pub live: bool,
}

/// Case-insensitive search over local manifests. No object calls.
pub fn run(ctx: &ArchiveContext, term: &str) -> Result<Vec<FindHit>> {
    let inventory = ctx.inventory_store().load()?;
    let hits = ctx.manifests().search(term)?;
    Ok(hits
        .into_iter()
        .map(|hit| {
            let bag = inventory
                .bags
                .values()
                .find(|b| bag_stem(&b.remote_key) == hit.bag_stem);
            FindHit {
                atom: bag.and_then(|b| owner_atom(&inventory, &b.branch, &b.atoms, &hit.path)),
                branch: bag.map(|b| b.branch.clone()),
                live: bag.is_some(),
                bag: bag.map(|b| b.id).or(hit.bag),
                bag_stem: hit.bag_stem,
                path: hit.path,
            }
        })
        .collect())
}

/// Atom owning `path`: the bag member named after the first segment below
/// the branch name. Loose files at the branch root fall to the root cluster.
fn owner_atom(inventory: &Inventory, branch: &str, atoms: &[String], path: &str) -> Option<String> {
    if atoms.len() == 1 {
        return atoms.first().cloned();
    }
    let mut segments = path.split('/');
    segments.next();
    let child = segments.next()?;
    atoms
        .iter()
        .filter(|a| inventory.atom(branch, a).is_some())
        .find(|a| a.rsplit('/').next() == Some(child))
        .or_else(|| atoms.iter().find(|a| a.ends_with(crate::scan::ROOT_CLUSTER)))
        .cloned()
}
