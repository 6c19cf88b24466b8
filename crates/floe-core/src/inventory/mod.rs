//! The durable atom → bag → remote-key record.

mod lock;
mod store;

pub use lock::{break_lock, InventoryLock, LockEntry};
pub use store::InventoryStore;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use floe_storage::StorageClass;
use floe_types::BagId;

pub const INVENTORY_VERSION: u32 = 1;

fn default_version() -> u32 {
    INVENTORY_VERSION
}

fn default_next_bag_id() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Next identifier handed out by the monotonic allocator.
    #[serde(default = "default_next_bag_id")]
    pub next_bag_id: u32,
    /// Identifiers whose remote objects were deleted. Only repack reissues these.
    #[serde(default)]
    pub retired_bag_ids: BTreeSet<BagId>,
    #[serde(default)]
    pub branches: BTreeMap<String, BranchRecord>,
    /// Bags referenced by at least one atom.
    #[serde(default)]
    pub bags: BTreeMap<BagId, BagRecord>,
    /// Bags no atom references any more; remote objects await prune.
    #[serde(default)]
    pub superseded: BTreeMap<BagId, SupersededBag>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for Inventory {
    fn default() -> Self {
        Self {
            version: INVENTORY_VERSION,
            next_bag_id: 1,
            retired_bag_ids: BTreeSet::new(),
            branches: BTreeMap::new(),
            bags: BTreeMap::new(),
            superseded: BTreeMap::new(),
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BranchRecord {
    /// Tags as resolved at the last scan, for reports.
    #[serde(default)]
    pub tags: String,
    #[serde(default)]
    pub last_scan: Option<DateTime<Utc>>,
    #[serde(default)]
    pub atoms: BTreeMap<String, AtomRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomRecord {
    pub fingerprint: String,
    pub size: u64,
    #[serde(default)]
    pub file_count: u64,
    /// One bag normally; several contiguous bags for an oversized atom.
    #[serde(default)]
    pub bags: Vec<BagId>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub last_upload: Option<DateTime<Utc>>,
}

impl AtomRecord {
    /// Tracked but not currently stored remotely (new, or reset).
    pub fn needs_upload(&self) -> bool {
        self.bags.is_empty()
    }
}

/// Position of a bag within an oversized atom's run of bags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub index: u32,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BagRecord {
    pub id: BagId,
    pub branch: String,
    pub remote_key: String,
    pub manifest_key: String,
    /// Actual uploaded size.
    pub size: u64,
    /// Sum of the raw atom sizes packed into the bag.
    pub payload_size: u64,
    pub capacity: u64,
    #[serde(default)]
    pub etag: String,
    pub uploaded_at: DateTime<Utc>,
    pub storage_class: StorageClass,
    /// Logical paths of the atoms the bag was built with.
    pub atoms: Vec<String>,
    #[serde(default)]
    pub fragment: Option<Fragment>,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub encrypted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupersededBag {
    pub id: BagId,
    pub branch: String,
    pub remote_key: String,
    pub manifest_key: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
    pub superseded_at: DateTime<Utc>,
}

/// Reference to an atom by branch key and logical path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AtomRef {
    pub branch: String,
    pub logical_path: String,
}

impl Inventory {
    /// Hand out `count` identifiers. With `recycle`, the lowest contiguous
    /// run of retired ids is reused first.
    pub fn allocate_ids(&mut self, count: u32, recycle: bool) -> Vec<BagId> {
        if count == 0 {
            return Vec::new();
        }
        if recycle {
            if let Some(start) = self.find_retired_run(count) {
                let ids: Vec<BagId> = (start..start + count).map(BagId).collect();
                for id in &ids {
                    self.retired_bag_ids.remove(id);
                }
                return ids;
            }
        }
        let start = self.next_bag_id;
        self.next_bag_id += count;
        (start..start + count).map(BagId).collect()
    }

    fn find_retired_run(&self, count: u32) -> Option<u32> {
        let mut run_start = None;
        let mut run_len = 0u32;
        let mut prev: Option<u32> = None;
        for id in &self.retired_bag_ids {
            let n = id.0;
            match prev {
                Some(p) if p + 1 == n => run_len += 1,
                _ => {
                    run_start = Some(n);
                    run_len = 1;
                }
            }
            if run_len == count {
                return run_start;
            }
            prev = Some(n);
        }
        None
    }

    pub fn atom(&self, branch: &str, logical_path: &str) -> Option<&AtomRecord> {
        self.branches.get(branch)?.atoms.get(logical_path)
    }

    pub fn atom_mut(&mut self, branch: &str, logical_path: &str) -> Option<&mut AtomRecord> {
        self.branches.get_mut(branch)?.atoms.get_mut(logical_path)
    }

    /// Every atom, across all branches.
    pub fn atoms(&self) -> impl Iterator<Item = (AtomRef, &AtomRecord)> {
        self.branches.iter().flat_map(|(branch, rec)| {
            rec.atoms.iter().map(move |(path, atom)| {
                (
                    AtomRef {
                        branch: branch.clone(),
                        logical_path: path.clone(),
                    },
                    atom,
                )
            })
        })
    }

    /// Atoms that currently reference `id`.
    pub fn atoms_in_bag(&self, id: BagId) -> Vec<AtomRef> {
        self.atoms()
            .filter(|(_, atom)| atom.bags.contains(&id))
            .map(|(r, _)| r)
            .collect()
    }

    /// Remote key → bag id for every referenced bag.
    pub fn live_keys(&self) -> BTreeMap<String, BagId> {
        self.bags
            .values()
            .map(|b| (b.remote_key.clone(), b.id))
            .collect()
    }

    pub fn referenced_bag_ids(&self) -> BTreeSet<BagId> {
        self.atoms()
            .flat_map(|(_, atom)| atom.bags.iter().copied())
            .collect()
    }

    /// Move bags no atom references into `superseded`. Returns their ids.
    pub fn sweep_unreferenced(&mut self, now: DateTime<Utc>) -> Vec<BagId> {
        let referenced = self.referenced_bag_ids();
        let orphaned: Vec<BagId> = self
            .bags
            .keys()
            .filter(|id| !referenced.contains(id))
            .copied()
            .collect();
        for id in &orphaned {
            if let Some(bag) = self.bags.remove(id) {
                self.superseded.insert(
                    *id,
                    SupersededBag {
                        id: *id,
                        branch: bag.branch,
                        remote_key: bag.remote_key,
                        manifest_key: bag.manifest_key,
                        size: bag.size,
                        uploaded_at: bag.uploaded_at,
                        superseded_at: now,
                    },
                );
            }
        }
        orphaned
    }

    /// Record that the remote object for `id` is gone. The id is retired.
    pub fn retire(&mut self, id: BagId) {
        self.bags.remove(&id);
        self.superseded.remove(&id);
        if id.0 < self.next_bag_id {
            self.retired_bag_ids.insert(id);
        }
    }

    /// Bytes in a live bag that belong to atoms which have since moved on.
    pub fn dead_bytes(&self, id: BagId) -> u64 {
        let Some(bag) = self.bags.get(&id) else {
            return 0;
        };
        if bag.fragment.is_some() {
            return 0;
        }
        let live: u64 = bag
            .atoms
            .iter()
            .filter_map(|path| self.atom(&bag.branch, path))
            .filter(|atom| atom.bags.contains(&id))
            .map(|atom| atom.size)
            .sum();
        bag.payload_size.saturating_sub(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bag(id: u32, atoms: &[&str]) -> BagRecord {
        BagRecord {
            id: BagId(id),
            branch: "/data".into(),
            remote_key: format!("2026-backup/h_data_bag_{id:05}_00000000.tar"),
            manifest_key: String::new(),
            size: 100,
            payload_size: 100,
            capacity: 1000,
            etag: String::new(),
            uploaded_at: Utc::now(),
            storage_class: StorageClass::DeepArchive,
            atoms: atoms.iter().map(|s| s.to_string()).collect(),
            fragment: None,
            compressed: false,
            encrypted: false,
        }
    }

    fn atom(bags: &[u32], size: u64) -> AtomRecord {
        AtomRecord {
            fingerprint: "f".into(),
            size,
            file_count: 1,
            bags: bags.iter().copied().map(BagId).collect(),
            pinned: false,
            last_upload: None,
        }
    }

    #[test]
    fn monotonic_allocation_ignores_retired_without_recycle() {
        let mut inv = Inventory::default();
        inv.next_bag_id = 5;
        inv.retired_bag_ids.insert(BagId(2));
        assert_eq!(inv.allocate_ids(2, false), vec![BagId(5), BagId(6)]);
        assert_eq!(inv.next_bag_id, 7);
        assert!(inv.retired_bag_ids.contains(&BagId(2)));
    }

    #[test]
    fn recycle_takes_lowest_contiguous_run() {
        let mut inv = Inventory::default();
        inv.next_bag_id = 20;
        inv.retired_bag_ids = [2, 4, 5, 6, 9].into_iter().map(BagId).collect();
        assert_eq!(inv.allocate_ids(1, true), vec![BagId(2)]);
        assert_eq!(
            inv.allocate_ids(3, true),
            vec![BagId(4), BagId(5), BagId(6)]
        );
        // No run of two left; falls back to the monotonic tail.
        assert_eq!(inv.allocate_ids(2, true), vec![BagId(20), BagId(21)]);
        assert_eq!(inv.retired_bag_ids.len(), 1);
    }

    #[test]
    fn sweep_moves_unreferenced_bags() {
        let mut inv = Inventory::default();
        inv.bags.insert(BagId(1), bag(1, &["/data/a"]));
        inv.bags.insert(BagId(2), bag(2, &["/data/b"]));
        let branch = inv.branches.entry("/data".into()).or_default();
        branch.atoms.insert("/data/a".into(), atom(&[1], 100));
        branch.atoms.insert("/data/b".into(), atom(&[3], 100));

        let swept = inv.sweep_unreferenced(Utc::now());
        assert_eq!(swept, vec![BagId(2)]);
        assert!(inv.bags.contains_key(&BagId(1)));
        assert!(inv.superseded.contains_key(&BagId(2)));
    }

    #[test]
    fn retire_adds_to_retired_set() {
        let mut inv = Inventory::default();
        inv.next_bag_id = 4;
        inv.bags.insert(BagId(3), bag(3, &[]));
        inv.retire(BagId(3));
        assert!(inv.bags.is_empty());
        assert!(inv.retired_bag_ids.contains(&BagId(3)));
    }

    #[test]
    fn dead_bytes_counts_departed_atoms() {
        let mut inv = Inventory::default();
        let mut b = bag(1, &["/data/a", "/data/b"]);
        b.payload_size = 300;
        inv.bags.insert(BagId(1), b);
        let branch = inv.branches.entry("/data".into()).or_default();
        branch.atoms.insert("/data/a".into(), atom(&[1], 100));
        branch.atoms.insert("/data/b".into(), atom(&[2], 200));
        assert_eq!(inv.dead_bytes(BagId(1)), 200);
    }

    #[test]
    fn json_round_trip_keeps_numeric_bag_keys() {
        let mut inv = Inventory::default();
        inv.bags.insert(BagId(7), bag(7, &["/data/a"]));
        let json = serde_json::to_string(&inv).unwrap();
        assert!(json.contains("\"7\""));
        let back: Inventory = serde_json::from_str(&json).unwrap();
        assert_eq!(back, inv);
    }
}
