use floe_core::commands::repack::{self, RepackOptions};
use floe_core::commands::util::ArchiveContext;

use crate::dispatch::CmdResult;
use crate::format::{dry_run_banner, format_bytes, format_money, print_transfers};
use crate::table::{num_cell, CliTableTheme};

pub(crate) fn run_repack(ctx: &ArchiveContext, branch: Option<String>, dry_run: bool) -> CmdResult {
    let report = repack::run(ctx, &RepackOptions { branch, dry_run })?;
    let currency = ctx.pricing().currency().to_string();

    if dry_run {
        print_transfers(&report.transfers);
        println!();
    }

    let theme = CliTableTheme::detect();
    let mut table =
        theme.new_data_table(&["Branch", "Before", "After", "Uploaded", "Reused", "Superseded", "Penalty"]);
    for b in &report.branches {
        if let Some(reason) = &b.skipped {
            eprintln!("Warning: {} skipped: {reason}", b.branch);
            continue;
        }
        table.add_row(vec![
            comfy_table::Cell::new(&b.branch),
            num_cell(b.bags_before),
            num_cell(b.bags_after),
            num_cell(format_bytes(b.bytes_uploaded)),
            num_cell(b.reused.len()),
            num_cell(b.superseded.len()),
            num_cell(format_money(b.penalty, &currency)),
        ]);
        if !b.held.is_empty() {
            eprintln!("Note: {} pinned atom(s) in {} left in place", b.held.len(), b.branch);
        }
    }
    println!("{table}");
    println!("Superseded bags stay remote until `floe prune` clears them.");
    dry_run_banner(dry_run);
    Ok(0)
}
