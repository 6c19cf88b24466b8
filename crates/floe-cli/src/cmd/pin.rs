use floe_core::commands::pin;
use floe_core::commands::util::ArchiveContext;

use crate::dispatch::CmdResult;
use crate::format::dry_run_banner;

pub(crate) fn run_pin(ctx: &ArchiveContext, atom: &str, pinned: bool, dry_run: bool) -> CmdResult {
    let (branch, changed) = pin::run(ctx, atom, pinned, dry_run)?;
    let state = if pinned { "pinned" } else { "unpinned" };
    if changed {
        println!("{atom} ({branch}) {state}.");
    } else {
        println!("{atom} ({branch}) already {state}.");
    }
    if changed {
        dry_run_banner(dry_run);
    }
    Ok(0)
}
