use floe_core::commands::reset::{self, ResetOptions, ResetPlan, ResetTarget};
use floe_core::commands::util::ArchiveContext;

use crate::dispatch::CmdResult;
use crate::format::{dry_run_banner, format_bytes, format_money, parse_bag_ids, print_transfers};
use crate::prompt::confirm;

pub(crate) enum Target<'a> {
    Bags(&'a [String]),
    Branch(&'a str),
}

pub(crate) fn run_reset(
    ctx: &ArchiveContext,
    target: Target<'_>,
    forget: bool,
    allow_early_delete: bool,
    yes: bool,
    dry_run: bool,
) -> CmdResult {
    let target = match target {
        Target::Bags(ids) => ResetTarget::Bags(parse_bag_ids(ids)?),
        Target::Branch(b) => ResetTarget::Branch(b.to_string()),
    };
    let currency = ctx.pricing().currency().to_string();
    let mut prompt_error = None;

    let outcome = reset::run(
        ctx,
        &ResetOptions {
            target,
            forget,
            allow_early_delete,
            dry_run,
        },
        |plan| {
            print_plan(plan, forget, &currency);
            if dry_run || yes {
                return true;
            }
            match confirm("Bags will be deleted from the remote.", "reset") {
                Ok(answer) => answer,
                Err(e) => {
                    prompt_error = Some(e);
                    false
                }
            }
        },
    )?;
    if let Some(e) = prompt_error {
        return Err(e.into());
    }

    if outcome.plan.is_empty() {
        println!("Nothing to reset.");
        return Ok(0);
    }
    if !outcome.applied {
        eprintln!("Aborted.");
        return Ok(0);
    }
    if dry_run {
        print_transfers(&outcome.transfers);
    } else {
        println!(
            "Deleted {} bag(s); {} atom(s) {}.",
            outcome.plan.bags.len(),
            outcome.plan.atoms.len(),
            if forget { "forgotten" } else { "queued for the next mirror" }
        );
    }
    dry_run_banner(dry_run);
    Ok(0)
}

fn print_plan(plan: &ResetPlan, forget: bool, currency: &str) {
    println!("Bags to delete:");
    for bag in &plan.bags {
        let young = if plan.young.contains(&bag.id) { "  (inside retention)" } else { "" };
        println!("  {}  {:>11}  {}{young}", bag.id, format_bytes(bag.size), bag.key);
    }
    if plan.encrypted_bags() > 0 {
        println!(
            "  {} encrypted bag(s): data can only be re-uploaded from the live source.",
            plan.encrypted_bags()
        );
    }
    println!(
        "Atoms to {}: {}",
        if forget { "forget" } else { "re-upload" },
        plan.atoms.len()
    );
    if let Some(branch) = &plan.forget_branch {
        println!("Branch record removed: {branch}");
    }
    println!(
        "Early-deletion penalty: {} (up to {} days early)",
        format_money(plan.impact.penalty, currency),
        plan.impact.max_days_remaining
    );
}
