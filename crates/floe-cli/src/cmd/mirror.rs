use floe_core::commands::mirror::{self, MirrorOptions};
use floe_core::commands::util::ArchiveContext;

use crate::dispatch::CmdResult;
use crate::format::{dry_run_banner, format_bytes, print_transfers};
use crate::table::{num_cell, CliTableTheme};

pub(crate) fn run_mirror(
    ctx: &ArchiveContext,
    branch: Option<String>,
    due_only: bool,
    dry_run: bool,
) -> CmdResult {
    let report = mirror::run(
        ctx,
        &MirrorOptions {
            branch,
            due_only,
            dry_run,
        },
    )?;

    if dry_run {
        print_transfers(&report.transfers);
        println!();
    }

    let theme = CliTableTheme::detect();
    let mut table = theme.new_data_table(&[
        "Branch", "New", "Dirty", "Unchanged", "Errored", "Removed", "Bags", "Uploaded", "Note",
    ]);
    for b in &report.branches {
        let note = match (&b.skipped, b.held.is_empty()) {
            (Some(reason), _) => format!("skipped: {reason}"),
            (None, false) => format!("{} pinned atom(s) held", b.held.len()),
            (None, true) => String::new(),
        };
        table.add_row(vec![
            comfy_table::Cell::new(&b.branch),
            num_cell(b.new),
            num_cell(b.dirty),
            num_cell(b.unchanged),
            num_cell(b.errored.len()),
            num_cell(b.removed.len()),
            num_cell(b.bags_uploaded),
            num_cell(format_bytes(b.bytes_uploaded)),
            comfy_table::Cell::new(note),
        ]);
    }
    println!("{table}");

    for b in &report.branches {
        for (atom, reason) in &b.errored {
            eprintln!("Warning: {atom} not archived: {reason}");
        }
    }
    println!(
        "{} bag(s), {} {}",
        report.bags_uploaded(),
        format_bytes(report.bytes_uploaded()),
        if dry_run { "would be uploaded" } else { "uploaded" }
    );
    dry_run_banner(dry_run);
    Ok(0)
}
