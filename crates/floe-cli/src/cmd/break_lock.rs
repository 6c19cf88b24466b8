use floe_core::config::FloeConfig;
use floe_core::inventory::break_lock;

use crate::dispatch::CmdResult;

pub(crate) fn run_break_lock(config: &FloeConfig) -> CmdResult {
    let paths = config.paths.resolve();
    if break_lock(&paths.inventory_file)? {
        println!("Removed inventory lock.");
    } else {
        println!("No lock found.");
    }
    Ok(0)
}
