//! First-fit-decreasing assignment of atoms to fixed-capacity bags.
//!
//! The packer only proposes groupings. Identifiers are allocated by the
//! inventory once the plan is accepted.

use std::collections::BTreeSet;

use tracing::debug;

use floe_types::{BagId, FloeError, Result};

use crate::branch::{Branch, BranchAction, PackingMode};
use crate::inventory::{Fragment, Inventory};

/// An atom offered to the packer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackItem {
    pub branch: String,
    pub logical_path: String,
    pub size: u64,
}

impl PackItem {
    pub fn new(branch: &str, logical_path: &str, size: u64) -> Self {
        Self {
            branch: branch.to_string(),
            logical_path: logical_path.to_string(),
            size,
        }
    }
}

/// A proposed bag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedBin {
    pub branch: String,
    /// Logical paths, in packing order.
    pub atoms: Vec<String>,
    /// Raw bytes of atom data planned into this bag.
    pub payload: u64,
    /// Set for each bag of an oversized atom's run.
    pub fragment: Option<Fragment>,
    /// Repack found an existing bag with exactly this content.
    pub reuse: Option<BagId>,
}

impl PlannedBin {
    pub fn needs_upload(&self) -> bool {
        self.reuse.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackPlan {
    pub bins: Vec<PlannedBin>,
    /// Bags that at least one atom moves out of.
    pub obsolete: BTreeSet<BagId>,
    /// Atoms left where they are because they, or a bag-mate, are pinned.
    pub held: Vec<String>,
}

impl PackPlan {
    pub fn upload_count(&self) -> usize {
        self.bins.iter().filter(|b| b.needs_upload()).count()
    }

    pub fn planned_bytes(&self) -> u64 {
        self.bins
            .iter()
            .filter(|b| b.needs_upload())
            .map(|b| b.payload)
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct Packer {
    capacity: u64,
}

struct OpenBin {
    atoms: Vec<String>,
    used: u64,
}

impl Packer {
    pub fn new(capacity: u64) -> Result<Self> {
        if capacity == 0 {
            return Err(FloeError::Config("bag capacity must be greater than zero".into()));
        }
        Ok(Self { capacity })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn check_items(&self, branch: &Branch, items: &[PackItem], action: BranchAction) -> Result<()> {
        branch.check_permitted(action)?;
        if let Some(stray) = items.iter().find(|i| i.branch != branch.path) {
            return Err(FloeError::PolicyViolation(format!(
                "atom {} belongs to branch {}, not {}",
                stray.logical_path, stray.branch, branch.path
            )));
        }
        Ok(())
    }

    /// Pack the New/Dirty atoms of one branch. Clean atoms are not offered
    /// and keep their bags. Pinned atoms are held in place.
    pub fn pack_incremental(
        &self,
        branch: &Branch,
        items: Vec<PackItem>,
        inventory: &Inventory,
    ) -> Result<PackPlan> {
        self.check_items(branch, &items, BranchAction::Mirror)?;

        let mut plan = PackPlan::default();
        let mut pool = Vec::with_capacity(items.len());
        for item in items {
            match inventory.atom(&branch.path, &item.logical_path) {
                Some(rec) if rec.pinned => {
                    debug!(atom = %item.logical_path, "pinned atom changed; holding");
                    plan.held.push(item.logical_path);
                }
                Some(rec) => {
                    plan.obsolete.extend(rec.bags.iter().copied());
                    pool.push(item);
                }
                None => pool.push(item),
            }
        }
        plan.bins = self.place(branch, pool);
        Ok(plan)
    }

    /// Re-pool every atom of a branch. Bags holding a pinned atom are frozen;
    /// groups identical to an existing bag keep that bag.
    pub fn pack_repack(
        &self,
        branch: &Branch,
        items: Vec<PackItem>,
        inventory: &Inventory,
    ) -> Result<PackPlan> {
        self.check_items(branch, &items, BranchAction::Repack)?;

        let frozen: BTreeSet<BagId> = inventory
            .branches
            .get(&branch.path)
            .map(|rec| {
                rec.atoms
                    .values()
                    .filter(|a| a.pinned)
                    .flat_map(|a| a.bags.iter().copied())
                    .collect()
            })
            .unwrap_or_default();

        let mut plan = PackPlan::default();
        let mut pool = Vec::with_capacity(items.len());
        for item in items {
            let current = inventory
                .atom(&branch.path, &item.logical_path)
                .map(|a| a.bags.clone())
                .unwrap_or_default();
            if current.iter().any(|b| frozen.contains(b)) {
                plan.held.push(item.logical_path);
                continue;
            }
            // An oversized atom already sitting in its own complete run
            // cannot be packed any tighter.
            if item.size > self.capacity {
                if let Some(run) = intact_run(inventory, &branch.path, &item.logical_path) {
                    plan.bins.extend(run);
                    continue;
                }
            }
            plan.obsolete.extend(current);
            pool.push(item);
        }

        let mut bins = self.place(branch, pool);
        for bin in &mut bins {
            bin.reuse = existing_match(inventory, bin);
            if let Some(id) = bin.reuse {
                plan.obsolete.remove(&id);
            }
        }
        plan.bins.extend(bins);
        Ok(plan)
    }

    /// Oversized atoms first, each on its own run of bags, then FFD over the rest.
    fn place(&self, branch: &Branch, mut pool: Vec<PackItem>) -> Vec<PlannedBin> {
        pool.sort_by(|a, b| {
            b.size
                .cmp(&a.size)
                .then_with(|| a.logical_path.cmp(&b.logical_path))
        });

        let mut out = Vec::new();
        let mut open: Vec<OpenBin> = Vec::new();

        for item in pool {
            if item.size > self.capacity {
                let count = u32::try_from(item.size.div_ceil(self.capacity)).unwrap_or(u32::MAX);
                out.extend(fragment_bins(&branch.path, &item.logical_path, item.size, count));
                continue;
            }

            if branch.mode == PackingMode::Sovereign {
                open.push(OpenBin {
                    atoms: vec![item.logical_path],
                    used: item.size,
                });
                continue;
            }

            match open
                .iter_mut()
                .find(|bin| bin.used + item.size <= self.capacity)
            {
                Some(bin) => {
                    bin.used += item.size;
                    bin.atoms.push(item.logical_path);
                }
                None => open.push(OpenBin {
                    atoms: vec![item.logical_path],
                    used: item.size,
                }),
            }
        }

        out.extend(open.into_iter().map(|bin| PlannedBin {
            branch: branch.path.clone(),
            atoms: bin.atoms,
            payload: bin.used,
            fragment: None,
            reuse: None,
        }));
        out
    }
}

/// The bins of one oversized atom's run, splitting its raw size evenly. The
/// count is provisional: staging re-cuts the run once the container stream
/// is built and its real length is known.
pub(crate) fn fragment_bins(branch: &str, path: &str, size: u64, count: u32) -> Vec<PlannedBin> {
    let count = count.max(1);
    let base = size / u64::from(count);
    let extra = size % u64::from(count);
    (0..count)
        .map(|index| PlannedBin {
            branch: branch.to_string(),
            atoms: vec![path.to_string()],
            payload: base + u64::from(u64::from(index) < extra),
            fragment: Some(Fragment { index, count }),
            reuse: None,
        })
        .collect()
}

/// The atom's current bags, when they form one complete fragment run that
/// holds nothing else.
fn intact_run(inventory: &Inventory, branch: &str, path: &str) -> Option<Vec<PlannedBin>> {
    let rec = inventory.atom(branch, path)?;
    let count = rec.bags.len();
    if count == 0 {
        return None;
    }
    rec.bags
        .iter()
        .enumerate()
        .map(|(index, id)| {
            let bag = inventory.bags.get(id)?;
            let frag = bag.fragment?;
            let in_place = frag.index as usize == index
                && frag.count as usize == count
                && bag.atoms.len() == 1
                && bag.atoms[0] == path;
            in_place.then(|| PlannedBin {
                branch: branch.to_string(),
                atoms: vec![path.to_string()],
                payload: bag.payload_size,
                fragment: Some(frag),
                reuse: Some(*id),
            })
        })
        .collect()
}

/// An existing whole bag whose atom set equals the bin's and that every one
/// of those atoms still references exclusively.
fn existing_match(inventory: &Inventory, bin: &PlannedBin) -> Option<BagId> {
    if bin.fragment.is_some() {
        return None;
    }
    let wanted: BTreeSet<&String> = bin.atoms.iter().collect();
    let first = inventory.atom(&bin.branch, bin.atoms.first()?)?;
    if first.bags.len() != 1 {
        return None;
    }
    let id = first.bags[0];
    let bag = inventory.bags.get(&id)?;
    if bag.fragment.is_some() {
        return None;
    }
    let have: BTreeSet<&String> = bag.atoms.iter().collect();
    if have != wanted {
        return None;
    }
    let all_there = bin.atoms.iter().all(|path| {
        inventory
            .atom(&bin.branch, path)
            .is_some_and(|a| a.bags == [id])
    });
    all_there.then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::BranchTag;
    use crate::inventory::{AtomRecord, BagRecord};
    use chrono::Utc;
    use floe_storage::StorageClass;

    const GB: u64 = 1_000_000_000;

    fn branch(mode: PackingMode) -> Branch {
        Branch::new("/data", mode).unwrap()
    }

    fn item(name: &str, size: u64) -> PackItem {
        PackItem::new("/data", &format!("/data/{name}"), size)
    }

    fn record(bags: &[u32], size: u64, pinned: bool) -> AtomRecord {
        AtomRecord {
            fingerprint: "fp".into(),
            size,
            file_count: 1,
            bags: bags.iter().copied().map(BagId).collect(),
            pinned,
            last_upload: None,
        }
    }

    fn bag(id: u32, atoms: &[&str], payload: u64) -> BagRecord {
        BagRecord {
            id: BagId(id),
            branch: "/data".into(),
            remote_key: format!("k{id}"),
            manifest_key: String::new(),
            size: payload,
            payload_size: payload,
            capacity: 40 * GB,
            etag: String::new(),
            uploaded_at: Utc::now(),
            storage_class: StorageClass::DeepArchive,
            atoms: atoms.iter().map(|a| format!("/data/{a}")).collect(),
            fragment: None,
            compressed: false,
            encrypted: false,
        }
    }

    #[test]
    fn ffd_twenty_fifteen_ten() {
        let packer = Packer::new(40 * GB).unwrap();
        let plan = packer
            .pack_incremental(
                &branch(PackingMode::Shared),
                vec![item("c", 10 * GB), item("a", 20 * GB), item("b", 15 * GB)],
                &Inventory::default(),
            )
            .unwrap();
        assert_eq!(plan.bins.len(), 2);
        assert_eq!(plan.bins[0].atoms, vec!["/data/a", "/data/b"]);
        assert_eq!(plan.bins[0].payload, 35 * GB);
        assert_eq!(plan.bins[1].atoms, vec!["/data/c"]);
        assert_eq!(plan.bins[1].payload, 10 * GB);
    }

    #[test]
    fn equal_sizes_break_ties_by_path() {
        let packer = Packer::new(10).unwrap();
        let plan = packer
            .pack_incremental(
                &branch(PackingMode::Shared),
                vec![item("z", 6), item("m", 6), item("a", 6)],
                &Inventory::default(),
            )
            .unwrap();
        let order: Vec<_> = plan.bins.iter().map(|b| b.atoms[0].clone()).collect();
        assert_eq!(order, vec!["/data/a", "/data/m", "/data/z"]);
    }

    #[test]
    fn oversized_atom_gets_exclusive_fragments() {
        let packer = Packer::new(40 * GB).unwrap();
        let plan = packer
            .pack_incremental(
                &branch(PackingMode::Shared),
                vec![item("huge", 100 * GB), item("small", GB)],
                &Inventory::default(),
            )
            .unwrap();
        let frags: Vec<_> = plan.bins.iter().filter(|b| b.fragment.is_some()).collect();
        assert_eq!(frags.len(), 3);
        for (i, f) in frags.iter().enumerate() {
            assert_eq!(f.atoms, vec!["/data/huge"]);
            assert_eq!(f.fragment, Some(Fragment { index: i as u32, count: 3 }));
            assert!(f.payload <= 40 * GB);
        }
        assert_eq!(frags.iter().map(|f| f.payload).sum::<u64>(), 100 * GB);
        // fragments are adjacent in the plan so allocated ids are contiguous
        assert!(plan.bins[..3].iter().all(|b| b.fragment.is_some()));
        assert_eq!(plan.bins[3].atoms, vec!["/data/small"]);
    }

    #[test]
    fn sovereign_never_shares() {
        let packer = Packer::new(100).unwrap();
        let plan = packer
            .pack_incremental(
                &branch(PackingMode::Sovereign),
                vec![item("x", 10), item("y", 10)],
                &Inventory::default(),
            )
            .unwrap();
        assert!(plan.bins.iter().all(|b| b.atoms.len() == 1));
    }

    #[test]
    fn foreign_atom_is_policy_violation() {
        let packer = Packer::new(100).unwrap();
        let err = packer
            .pack_incremental(
                &branch(PackingMode::Shared),
                vec![PackItem::new("/other", "/other/a", 1)],
                &Inventory::default(),
            )
            .unwrap_err();
        assert!(matches!(err, FloeError::PolicyViolation(_)));
    }

    #[test]
    fn locked_branch_is_policy_violation() {
        let packer = Packer::new(100).unwrap();
        let mut b = branch(PackingMode::Shared);
        b.tags.insert(BranchTag::Locked);
        let err = packer
            .pack_incremental(&b, vec![item("a", 1)], &Inventory::default())
            .unwrap_err();
        assert!(matches!(err, FloeError::PolicyViolation(_)));
    }

    #[test]
    fn dirty_atom_vacates_old_bag_and_pinned_is_held() {
        let mut inv = Inventory::default();
        let rec = inv.branches.entry("/data".into()).or_default();
        rec.atoms.insert("/data/a".into(), record(&[4], 10, false));
        rec.atoms.insert("/data/p".into(), record(&[5], 10, true));
        let packer = Packer::new(100).unwrap();
        let plan = packer
            .pack_incremental(
                &branch(PackingMode::Shared),
                vec![item("a", 12), item("p", 11)],
                &inv,
            )
            .unwrap();
        assert_eq!(plan.obsolete, [BagId(4)].into_iter().collect());
        assert_eq!(plan.held, vec!["/data/p"]);
        assert_eq!(plan.bins.len(), 1);
        assert_eq!(plan.bins[0].atoms, vec!["/data/a"]);
    }

    #[test]
    fn repack_consolidates_and_reuses_identical_bags() {
        let mut inv = Inventory::default();
        {
            let rec = inv.branches.entry("/data".into()).or_default();
            rec.atoms.insert("/data/a".into(), record(&[1], 60, false));
            rec.atoms.insert("/data/b".into(), record(&[2], 30, false));
            rec.atoms.insert("/data/c".into(), record(&[3], 30, false));
            rec.atoms.insert("/data/d".into(), record(&[4], 50, false));
        }
        inv.bags.insert(BagId(1), bag(1, &["a"], 60));
        inv.bags.insert(BagId(2), bag(2, &["b"], 30));
        inv.bags.insert(BagId(3), bag(3, &["c"], 30));
        inv.bags.insert(BagId(4), bag(4, &["d"], 50));

        let packer = Packer::new(100).unwrap();
        let items = vec![item("a", 60), item("b", 30), item("c", 30), item("d", 50)];
        let plan = packer
            .pack_repack(&branch(PackingMode::Shared), items, &inv)
            .unwrap();

        // FFD: [a60, b30], [d50, c30]
        assert_eq!(plan.bins.len(), 2);
        assert!(plan.bins.iter().all(|b| b.reuse.is_none()));
        assert_eq!(
            plan.obsolete,
            [1, 2, 3, 4].into_iter().map(BagId).collect()
        );
        let mut before: Vec<_> = ["a", "b", "c", "d"].iter().map(|s| format!("/data/{s}")).collect();
        let mut after: Vec<_> = plan.bins.iter().flat_map(|b| b.atoms.clone()).collect();
        before.sort();
        after.sort();
        assert_eq!(before, after);
    }

    #[test]
    fn repack_freezes_bags_with_pinned_atoms() {
        let mut inv = Inventory::default();
        {
            let rec = inv.branches.entry("/data".into()).or_default();
            rec.atoms.insert("/data/a".into(), record(&[1], 10, true));
            rec.atoms.insert("/data/b".into(), record(&[1], 10, false));
            rec.atoms.insert("/data/c".into(), record(&[2], 10, false));
        }
        inv.bags.insert(BagId(1), bag(1, &["a", "b"], 20));
        inv.bags.insert(BagId(2), bag(2, &["c"], 10));

        let packer = Packer::new(100).unwrap();
        let plan = packer
            .pack_repack(
                &branch(PackingMode::Shared),
                vec![item("a", 10), item("b", 10), item("c", 10)],
                &inv,
            )
            .unwrap();
        assert_eq!(plan.held, vec!["/data/a", "/data/b"]);
        assert_eq!(plan.bins.len(), 1);
        // c alone in bag 2 already: nothing to upload
        assert_eq!(plan.bins[0].reuse, Some(BagId(2)));
        assert!(plan.obsolete.is_empty());
        assert_eq!(plan.upload_count(), 0);
    }

    #[test]
    fn repack_keeps_a_complete_fragment_run() {
        let mut inv = Inventory::default();
        inv.branches
            .entry("/data".into())
            .or_default()
            .atoms
            .insert("/data/huge".into(), record(&[7, 8, 9, 10], 100 * GB, false));
        for (index, id) in (7..=10).enumerate() {
            let mut b = bag(id, &["huge"], 25 * GB);
            b.fragment = Some(Fragment { index: index as u32, count: 4 });
            inv.bags.insert(BagId(id), b);
        }

        let packer = Packer::new(40 * GB).unwrap();
        let plan = packer
            .pack_repack(&branch(PackingMode::Shared), vec![item("huge", 100 * GB)], &inv)
            .unwrap();
        // the stored run has four parts although raw sizing would plan three
        assert_eq!(plan.bins.len(), 4);
        assert_eq!(plan.upload_count(), 0);
        assert!(plan.obsolete.is_empty());
        let reused: Vec<_> = plan.bins.iter().filter_map(|b| b.reuse).collect();
        assert_eq!(reused, (7..=10).map(BagId).collect::<Vec<_>>());
    }

    #[test]
    fn broken_fragment_run_is_repacked() {
        let mut inv = Inventory::default();
        inv.branches
            .entry("/data".into())
            .or_default()
            .atoms
            .insert("/data/huge".into(), record(&[7, 8], 100 * GB, false));
        let mut b = bag(7, &["huge"], 50 * GB);
        b.fragment = Some(Fragment { index: 0, count: 3 });
        inv.bags.insert(BagId(7), b);

        let packer = Packer::new(40 * GB).unwrap();
        let plan = packer
            .pack_repack(&branch(PackingMode::Shared), vec![item("huge", 100 * GB)], &inv)
            .unwrap();
        assert_eq!(plan.upload_count(), 3);
        assert_eq!(plan.obsolete, [7, 8].into_iter().map(BagId).collect());
    }
}
