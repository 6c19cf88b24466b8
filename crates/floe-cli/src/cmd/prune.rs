use floe_core::commands::prune;
use floe_core::commands::util::ArchiveContext;

use crate::dispatch::CmdResult;
use crate::format::{dry_run_banner, format_bytes};

pub(crate) fn run_prune(ctx: &ArchiveContext, dry_run: bool) -> CmdResult {
    let report = prune::run(ctx, dry_run)?;

    for bag in &report.deleted {
        println!(
            "{:<6} {:>11}  {}  ({} days old)",
            if dry_run { "would" } else { "delete" },
            format_bytes(bag.size),
            bag.key,
            bag.age_days
        );
    }
    for young in &report.skipped_young {
        println!(
            "{:<6} {:>11}  {}  ({} days of retention left)",
            "keep",
            format_bytes(young.size),
            young.key,
            young.days_left
        );
    }
    for id in &report.forgotten {
        println!("retire {id} (already absent remotely)");
    }

    println!(
        "{} {} orphan bag(s), {}; {} too young",
        if dry_run { "Would delete" } else { "Deleted" },
        report.deleted.len(),
        format_bytes(report.freed_bytes()),
        report.skipped_young.len()
    );
    dry_run_banner(dry_run);
    Ok(0)
}
