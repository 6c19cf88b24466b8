use floe_core::commands::util::ArchiveContext;
use floe_core::config::FloeConfig;

use crate::cli::{Commands, ResetCommand, RestoreCommand, ShowCommand};
use crate::cmd;
use crate::signal::shutdown_flag;

pub(crate) type CmdResult = Result<i32, Box<dyn std::error::Error>>;

/// Run one command and return the process exit code.
pub(crate) fn dispatch_command(command: &Commands, cfg: FloeConfig, dry_run: bool) -> CmdResult {
    // Lock removal must work even when the backend cannot be reached.
    if let Commands::BreakLock = command {
        return cmd::break_lock::run_break_lock(&cfg);
    }

    let ctx = ArchiveContext::open(cfg, Some(shutdown_flag()))?;
    match command {
        Commands::Mirror { branch, due_only } => {
            cmd::mirror::run_mirror(&ctx, branch.clone(), *due_only, dry_run)
        }
        Commands::Reset {
            target,
            forget,
            allow_early_delete,
            yes,
        } => {
            let target = match target {
                ResetCommand::Bag { ids } => cmd::reset::Target::Bags(ids),
                ResetCommand::Branch { branch } => cmd::reset::Target::Branch(branch),
            };
            cmd::reset::run_reset(&ctx, target, *forget, *allow_early_delete, *yes, dry_run)
        }
        Commands::Repack { branch } => cmd::repack::run_repack(&ctx, branch.clone(), dry_run),
        Commands::Prune => cmd::prune::run_prune(&ctx, dry_run),
        Commands::Audit => cmd::audit::run_audit(&ctx),
        Commands::Find { term } => cmd::find::run_find(&ctx, term),
        Commands::Restore { command } => match command {
            RestoreCommand::Status => cmd::restore::run_status(&ctx),
            RestoreCommand::Clear => cmd::restore::run_clear(&ctx),
            other => cmd::restore::run_restore(&ctx, other, dry_run),
        },
        Commands::Show { command } => match command {
            ShowCommand::Tree => cmd::show::run_tree(&ctx),
            ShowCommand::Branch { branch } => cmd::show::run_branch(&ctx, branch),
            ShowCommand::Bag { id } => cmd::show::run_bag(&ctx, id),
            ShowCommand::Atom { path } => cmd::show::run_atom(&ctx, path),
        },
        Commands::Report => cmd::show::run_report(&ctx),
        Commands::Pin { atom } => cmd::pin::run_pin(&ctx, atom, true, dry_run),
        Commands::Unpin { atom } => cmd::pin::run_pin(&ctx, atom, false, dry_run),
        Commands::BreakLock | Commands::Config { .. } => Err(format!(
            "'{}' command should be handled before dispatch",
            command.name()
        )
        .into()),
    }
}
