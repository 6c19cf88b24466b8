//! Cost figures for reports and destructive-action plans. Nothing here
//! affects what gets uploaded or deleted.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use floe_types::BagId;

use crate::config::PricingConfig;
use crate::inventory::Inventory;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const DAYS_PER_MONTH: f64 = 30.0;

pub fn gib(bytes: u64) -> f64 {
    bytes as f64 / GIB
}

#[derive(Debug, Clone)]
pub struct Pricing {
    table: PricingConfig,
    min_retention_days: u32,
}

impl Pricing {
    pub fn new(table: PricingConfig, min_retention_days: u32) -> Self {
        Self {
            table,
            min_retention_days,
        }
    }

    pub fn currency(&self) -> &str {
        &self.table.currency
    }

    pub fn monthly_cost(&self, bytes: u64) -> f64 {
        gib(bytes) * self.table.price_per_gb_month
    }

    pub fn put_cost(&self, requests: usize) -> f64 {
        requests as f64 / 1000.0 * self.table.price_per_1000_puts
    }

    /// Days of the minimum retention period still owed at `now`.
    pub fn days_remaining(&self, uploaded_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
        let held = (now - uploaded_at).num_days();
        (i64::from(self.min_retention_days) - held).max(0)
    }

    /// Storage charge for the rest of the retention period, billed when an
    /// object is deleted early.
    pub fn early_deletion_penalty(&self, bytes: u64, uploaded_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let days = self.days_remaining(uploaded_at, now);
        self.monthly_cost(bytes) * days as f64 / DAYS_PER_MONTH
    }

    /// Thaw plus egress for `bytes` spread over `objects` bags.
    pub fn retrieval_cost(&self, bytes: u64, objects: usize, bulk: bool) -> f64 {
        let thaw = if bulk {
            self.table.thaw_bulk_per_gb
        } else {
            self.table.thaw_standard_per_gb
        };
        gib(bytes) * (thaw + self.table.egress_per_gb) + self.put_cost(objects)
    }
}

/// Early-deletion impact of removing a set of bags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeletionImpact {
    pub bags: usize,
    pub bytes: u64,
    pub penalty: f64,
    pub max_days_remaining: i64,
}

pub fn deletion_impact(
    inventory: &Inventory,
    pricing: &Pricing,
    ids: impl IntoIterator<Item = BagId>,
    now: DateTime<Utc>,
) -> DeletionImpact {
    let mut impact = DeletionImpact::default();
    for id in ids {
        let (size, uploaded_at) = match (inventory.bags.get(&id), inventory.superseded.get(&id)) {
            (Some(b), _) => (b.size, b.uploaded_at),
            (None, Some(s)) => (s.size, s.uploaded_at),
            (None, None) => continue,
        };
        impact.bags += 1;
        impact.bytes += size;
        impact.penalty += pricing.early_deletion_penalty(size, uploaded_at, now);
        impact.max_days_remaining = impact
            .max_days_remaining
            .max(pricing.days_remaining(uploaded_at, now));
    }
    impact
}

/// Per-bag fill figures.
#[derive(Debug, Clone, PartialEq)]
pub struct BagFill {
    pub id: BagId,
    pub branch: String,
    pub size: u64,
    pub payload: u64,
    pub dead: u64,
    pub fill: f64,
}

/// Whole-archive cost and waste summary.
#[derive(Debug, Clone, PartialEq)]
pub struct CostReport {
    pub bag_count: usize,
    pub stored_bytes: u64,
    pub live_bytes: u64,
    pub dead_bytes: u64,
    pub superseded_bags: usize,
    pub superseded_bytes: u64,
    pub monthly_cost: f64,
    /// Dead and superseded bytes as a share of everything stored.
    pub waste_pct: f64,
    /// Penalty a repack would trigger by deleting every bag with dead bytes.
    pub repack_penalty: f64,
    pub retrieval_standard: f64,
    pub retrieval_bulk: f64,
    pub fills: Vec<BagFill>,
    pub per_branch: BTreeMap<String, (usize, u64)>,
}

pub fn cost_report(inventory: &Inventory, pricing: &Pricing, now: DateTime<Utc>) -> CostReport {
    let mut fills = Vec::new();
    let mut per_branch: BTreeMap<String, (usize, u64)> = BTreeMap::new();
    let mut stored = 0u64;
    let mut dead_total = 0u64;
    let mut repack_penalty = 0.0;

    for bag in inventory.bags.values() {
        let dead = inventory.dead_bytes(bag.id);
        stored += bag.size;
        dead_total += dead;
        if dead > 0 {
            repack_penalty += pricing.early_deletion_penalty(bag.size, bag.uploaded_at, now);
        }
        let entry = per_branch.entry(bag.branch.clone()).or_default();
        entry.0 += 1;
        entry.1 += bag.size;
        let fill = if bag.capacity == 0 {
            0.0
        } else {
            bag.payload_size.saturating_sub(dead) as f64 / bag.capacity as f64
        };
        fills.push(BagFill {
            id: bag.id,
            branch: bag.branch.clone(),
            size: bag.size,
            payload: bag.payload_size,
            dead,
            fill: fill.min(1.0),
        });
    }

    let superseded_bytes: u64 = inventory.superseded.values().map(|s| s.size).sum();
    let all_bytes = stored + superseded_bytes;
    let waste_pct = if all_bytes == 0 {
        0.0
    } else {
        (dead_total + superseded_bytes) as f64 / all_bytes as f64 * 100.0
    };
    let live_bytes = stored.saturating_sub(dead_total);

    CostReport {
        bag_count: inventory.bags.len(),
        stored_bytes: stored,
        live_bytes,
        dead_bytes: dead_total,
        superseded_bags: inventory.superseded.len(),
        superseded_bytes,
        monthly_cost: pricing.monthly_cost(all_bytes),
        waste_pct,
        repack_penalty,
        retrieval_standard: pricing.retrieval_cost(stored, inventory.bags.len(), false),
        retrieval_bulk: pricing.retrieval_cost(stored, inventory.bags.len(), true),
        fills,
        per_branch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{AtomRecord, BagRecord, BranchRecord};
    use chrono::Duration;
    use floe_storage::StorageClass;

    fn pricing() -> Pricing {
        Pricing::new(PricingConfig::default(), 180)
    }

    #[test]
    fn penalty_scales_with_remaining_days() {
        let p = pricing();
        let now = Utc::now();
        let ten_gib = 10 * 1024 * 1024 * 1024;
        assert_eq!(p.early_deletion_penalty(ten_gib, now - Duration::days(200), now), 0.0);
        let young = p.early_deletion_penalty(ten_gib, now - Duration::days(0), now);
        let expected = 10.0 * 0.00099 * 180.0 / 30.0;
        assert!((young - expected).abs() < 1e-9, "{young}");
        assert_eq!(p.days_remaining(now - Duration::days(30), now), 150);
    }

    #[test]
    fn report_counts_dead_bytes() {
        let now = Utc::now();
        let mut inv = Inventory::default();
        let mut branch = BranchRecord::default();
        branch.atoms.insert(
            "/d/a".into(),
            AtomRecord {
                fingerprint: "f".into(),
                size: 60,
                file_count: 1,
                bags: vec![BagId(1)],
                pinned: false,
                last_upload: Some(now),
            },
        );
        // `/d/b` moved to another bag, leaving 40 dead bytes in bag 1.
        inv.branches.insert("/d".into(), branch);
        inv.bags.insert(
            BagId(1),
            BagRecord {
                id: BagId(1),
                branch: "/d".into(),
                remote_key: "k1".into(),
                manifest_key: "m1".into(),
                size: 100,
                payload_size: 100,
                capacity: 200,
                etag: "e".into(),
                uploaded_at: now,
                storage_class: StorageClass::DeepArchive,
                atoms: vec!["/d/a".into(), "/d/b".into()],
                fragment: None,
                compressed: false,
                encrypted: false,
            },
        );
        let r = cost_report(&inv, &pricing(), now);
        assert_eq!(r.dead_bytes, 40);
        assert_eq!(r.live_bytes, 60);
        assert!((r.waste_pct - 40.0).abs() < 1e-9);
        assert!((r.fills[0].fill - 0.3).abs() < 1e-9);
        assert!(r.repack_penalty > 0.0);
    }
}
