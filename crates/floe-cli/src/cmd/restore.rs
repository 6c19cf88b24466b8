use std::path::PathBuf;

use chrono::Utc;

use floe_storage::RestoreTier;

use floe_core::commands::restore::{self, RestoreJob, RestoreOptions, RestoreStage, RestoreTarget};
use floe_core::commands::util::ArchiveContext;

use crate::cli::{RestoreArgs, RestoreCommand};
use crate::dispatch::CmdResult;
use crate::format::{dry_run_banner, format_time, parse_bag_ids};
use crate::table::{num_cell, CliTableTheme};

pub(crate) fn run_restore(ctx: &ArchiveContext, command: &RestoreCommand, dry_run: bool) -> CmdResult {
    let (target, args) = match command {
        RestoreCommand::File { path, opts } => (RestoreTarget::File(path.clone()), opts),
        RestoreCommand::Bag { ids, opts } => (RestoreTarget::Bags(parse_bag_ids(ids)?), opts),
        RestoreCommand::Branch { branch, opts } => (RestoreTarget::Branch(branch.clone()), opts),
        RestoreCommand::Tree { opts } => (RestoreTarget::Tree, opts),
        RestoreCommand::Status | RestoreCommand::Clear => {
            return Err("restore status/clear are handled separately".into())
        }
    };
    let opts = options(target, args, dry_run)?;
    let report = restore::run(ctx, &opts)?;

    print_jobs(&report.jobs);
    if report.is_complete() {
        println!("Restore complete in {}", report.dest.display());
    } else if report.failed() > 0 {
        eprintln!(
            "{} job(s) failed; run the same command again to retry them.",
            report.failed()
        );
        return Ok(1);
    } else if report.waiting() > 0 {
        println!(
            "{} bag(s) still thawing; run the same command again later to continue.",
            report.waiting()
        );
    }
    dry_run_banner(dry_run);
    Ok(0)
}

fn options(
    target: RestoreTarget,
    args: &RestoreArgs,
    dry_run: bool,
) -> Result<RestoreOptions, Box<dyn std::error::Error>> {
    let tier = args.tier.as_deref().map(str::parse::<RestoreTier>).transpose()?;
    Ok(RestoreOptions {
        target,
        dest: PathBuf::from(&args.dest),
        tier,
        days: args.days,
        dry_run,
    })
}

pub(crate) fn run_status(ctx: &ArchiveContext) -> CmdResult {
    let jobs = restore::status(ctx)?;
    if jobs.is_empty() {
        println!("No restore jobs recorded.");
        return Ok(0);
    }
    print_jobs(&jobs);
    Ok(0)
}

pub(crate) fn run_clear(ctx: &ArchiveContext) -> CmdResult {
    let removed = restore::clear_finished(ctx)?;
    println!("Removed {removed} finished job(s).");
    Ok(0)
}

fn print_jobs(jobs: &[RestoreJob]) {
    let now = Utc::now();
    let theme = CliTableTheme::detect();
    let mut table = theme.new_data_table(&["Bag", "Stage", "Tier", "Files", "Updated", "Note"]);
    for job in jobs {
        let note = match job.stage {
            RestoreStage::Failed => job.last_error.clone().unwrap_or_default(),
            _ => match job.thaw_hours_left(now) {
                Some(h) if job.stage.is_waiting() => format!("~{h}h left"),
                _ => job.dest.display().to_string(),
            },
        };
        table.add_row(vec![
            comfy_table::Cell::new(job.bag),
            comfy_table::Cell::new(job.stage.as_str()),
            comfy_table::Cell::new(job.tier.to_string()),
            num_cell(job.restored_files),
            comfy_table::Cell::new(format_time(Some(job.updated_at))),
            comfy_table::Cell::new(note),
        ]);
    }
    println!("{table}");
}
