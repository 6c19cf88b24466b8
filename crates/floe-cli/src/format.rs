use chrono::{DateTime, Utc};

use floe_core::ledger::LedgerEntry;
use floe_types::BagId;

pub(crate) fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;
    const TIB: u64 = GIB * 1024;

    if bytes >= TIB {
        format!("{:.2} TiB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

pub(crate) fn format_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub(crate) fn format_money(amount: f64, currency: &str) -> String {
    format!("{amount:.2} {currency}")
}

pub(crate) fn parse_bag_ids(raw: &[String]) -> Result<Vec<BagId>, Box<dyn std::error::Error>> {
    raw.iter()
        .map(|s| s.parse::<BagId>().map_err(|e| e.into()))
        .collect()
}

/// Print every ledger entry, one line each.
pub(crate) fn print_transfers(entries: &[LedgerEntry]) {
    for e in entries {
        let note = e.note.as_deref().map(|n| format!("  ({n})")).unwrap_or_default();
        println!(
            "{:<13} {:>11}  {}{note}",
            e.action.as_str(),
            format_bytes(e.bytes),
            e.key
        );
    }
}

pub(crate) fn dry_run_banner(dry_run: bool) {
    if dry_run {
        println!("Dry run: nothing was changed. Pass --run to apply.");
    }
}
