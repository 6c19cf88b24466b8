use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{error, info, warn};

use floe_storage::{ObjectInfo, StorageClass};
use floe_types::{BagId, Result, RunId};

use crate::inventory::Inventory;
use crate::keys::is_bag_key;
use crate::ledger::Ledger;

use super::util::ArchiveContext;

/// A discrepancy between the inventory and the remote listing.
#[derive(Debug, Clone, PartialEq)]
pub enum AuditFinding {
    /// Recorded in the inventory but absent remotely.
    Missing { bag: BagId, key: String },
    /// Present remotely but unknown to the inventory.
    Orphan { key: String, size: u64, age_days: i64 },
    /// Stored in a class other than the configured bag class.
    WrongClass {
        bag: BagId,
        key: String,
        expected: StorageClass,
        actual: StorageClass,
    },
    /// Remote etag differs from the one recorded at upload.
    EtagMismatch {
        bag: BagId,
        key: String,
        expected: String,
        actual: String,
    },
}

impl AuditFinding {
    pub fn severity(&self) -> &'static str {
        match self {
            AuditFinding::Missing { .. } => "ALERT",
            AuditFinding::EtagMismatch { .. } => "CRITICAL",
            AuditFinding::WrongClass { .. } => "COST",
            AuditFinding::Orphan { .. } => "ORPHAN",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditReport {
    /// Bags present remotely and matching their record.
    pub ok: usize,
    pub findings: Vec<AuditFinding>,
}

impl AuditReport {
    pub fn alerts(&self) -> impl Iterator<Item = &AuditFinding> {
        self.findings.iter().filter(|f| {
            matches!(
                f,
                AuditFinding::Missing { .. } | AuditFinding::EtagMismatch { .. }
            )
        })
    }

    pub fn orphans(&self) -> impl Iterator<Item = &AuditFinding> {
        self.findings
            .iter()
            .filter(|f| matches!(f, AuditFinding::Orphan { .. }))
    }

    /// Missing or corrupted bags were found.
    pub fn has_alerts(&self) -> bool {
        self.alerts().next().is_some()
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Compare the inventory with one listing of the bucket. Read-only.
pub fn run(ctx: &ArchiveContext) -> Result<AuditReport> {
    let inventory = ctx.inventory_store().load()?;
    let ledger = std::sync::Arc::new(Ledger::ephemeral(RunId::generate(), true));
    let tc = ctx.coordinator(ledger);
    let listed = tc.list(&ctx.config.remote.listing_prefix())?;
    let report = compare(&inventory, &listed, &ctx.config.remote.bag_storage_class);
    info!(
        ok = report.ok,
        findings = report.findings.len(),
        "audit finished"
    );
    Ok(report)
}

/// Reconcile inventory against a listing. Manifest and system objects are
/// never orphans.
pub fn compare(inventory: &Inventory, listed: &[ObjectInfo], expected: &StorageClass) -> AuditReport {
    let remote: BTreeMap<&str, &ObjectInfo> = listed
        .iter()
        .filter(|o| is_bag_key(&o.key))
        .map(|o| (o.key.as_str(), o))
        .collect();
    let now = Utc::now();
    let mut report = AuditReport::default();

    for bag in inventory.bags.values() {
        let Some(obj) = remote.get(bag.remote_key.as_str()) else {
            error!(bag = %bag.id, key = %bag.remote_key, "ALERT: bag missing remotely");
            report.findings.push(AuditFinding::Missing {
                bag: bag.id,
                key: bag.remote_key.clone(),
            });
            continue;
        };
        let mut clean = true;
        if !bag.etag.is_empty() && !obj.etag.is_empty() && bag.etag != obj.etag {
            error!(bag = %bag.id, "CRITICAL: etag mismatch");
            report.findings.push(AuditFinding::EtagMismatch {
                bag: bag.id,
                key: bag.remote_key.clone(),
                expected: bag.etag.clone(),
                actual: obj.etag.clone(),
            });
            clean = false;
        }
        if obj.storage_class != *expected {
            warn!(bag = %bag.id, class = %obj.storage_class, "COST: unexpected storage class");
            report.findings.push(AuditFinding::WrongClass {
                bag: bag.id,
                key: bag.remote_key.clone(),
                expected: expected.clone(),
                actual: obj.storage_class.clone(),
            });
            clean = false;
        }
        if clean {
            report.ok += 1;
        }
    }

    let live = inventory.live_keys();
    for (key, obj) in &remote {
        if !live.contains_key(*key) {
            report.findings.push(AuditFinding::Orphan {
                key: key.to_string(),
                size: obj.size,
                age_days: (now - obj.last_modified).num_days(),
            });
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::BagRecord;

    fn bag(id: u32, etag: &str) -> BagRecord {
        BagRecord {
            id: BagId(id),
            branch: "/d".into(),
            remote_key: format!("2026-backup/h_d_bag_{id:05}_0a0b0c0d.tar"),
            manifest_key: format!("2026-backup/manifests/h_d_bag_{id:05}_0a0b0c0d.txt"),
            size: 10,
            payload_size: 10,
            capacity: 100,
            etag: etag.into(),
            uploaded_at: Utc::now(),
            storage_class: StorageClass::DeepArchive,
            atoms: vec![],
            fragment: None,
            compressed: false,
            encrypted: false,
        }
    }

    fn listed(key: &str, etag: &str, class: StorageClass) -> ObjectInfo {
        ObjectInfo {
            key: key.into(),
            size: 10,
            etag: etag.into(),
            last_modified: Utc::now(),
            storage_class: class,
        }
    }

    #[test]
    fn classifies_missing_orphan_class_and_etag() {
        let mut inv = Inventory::default();
        for (id, etag) in [(1, "e1"), (2, "e2"), (3, "e3"), (4, "e4")] {
            inv.bags.insert(BagId(id), bag(id, etag));
        }
        let listing = vec![
            listed(&bag(1, "").remote_key, "e1", StorageClass::DeepArchive),
            listed(&bag(2, "").remote_key, "bad", StorageClass::DeepArchive),
            listed(&bag(3, "").remote_key, "e3", StorageClass::Standard),
            listed("2026-backup/h_d_bag_00009_ffffffff.tar", "x", StorageClass::DeepArchive),
            listed("2026-backup/manifests/h_d_bag_00001_0a0b0c0d.txt", "m", StorageClass::Standard),
            listed("2026-backup/system/inventory.json", "s", StorageClass::Standard),
        ];
        let report = compare(&inv, &listing, &StorageClass::DeepArchive);

        assert_eq!(report.ok, 1);
        assert!(report.has_alerts());
        assert!(report
            .findings
            .contains(&AuditFinding::Missing { bag: BagId(4), key: bag(4, "").remote_key }));
        assert!(report
            .findings
            .iter()
            .any(|f| matches!(f, AuditFinding::EtagMismatch { bag, .. } if *bag == BagId(2))));
        assert!(report
            .findings
            .iter()
            .any(|f| matches!(f, AuditFinding::WrongClass { bag, .. } if *bag == BagId(3))));
        let orphans: Vec<_> = report.orphans().collect();
        assert_eq!(orphans.len(), 1);
    }
}
