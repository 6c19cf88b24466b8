use floe_core::commands::find;
use floe_core::commands::util::ArchiveContext;

use crate::dispatch::CmdResult;
use crate::table::CliTableTheme;

pub(crate) fn run_find(ctx: &ArchiveContext, term: &str) -> CmdResult {
    let hits = find::run(ctx, term)?;
    if hits.is_empty() {
        println!("No manifest lists '{term}'.");
        return Ok(0);
    }

    let theme = CliTableTheme::detect();
    let mut table = theme.new_data_table(&["Path", "Bag", "Atom", "State"]);
    for hit in &hits {
        table.add_row(vec![
            hit.path.clone(),
            hit.bag.map(|b| b.to_string()).unwrap_or_else(|| hit.bag_stem.clone()),
            hit.atom.clone().unwrap_or_else(|| "-".into()),
            if hit.live { "live" } else { "superseded" }.to_string(),
        ]);
    }
    println!("{table}");
    Ok(0)
}
