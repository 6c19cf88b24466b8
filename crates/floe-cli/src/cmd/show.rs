use floe_core::commands::show;
use floe_core::commands::util::ArchiveContext;
use floe_types::BagId;

use crate::dispatch::CmdResult;
use crate::format::{format_bytes, format_money, format_time};
use crate::table::{add_kv_row, num_cell, CliTableTheme};

pub(crate) fn run_tree(ctx: &ArchiveContext) -> CmdResult {
    let rows = show::tree(ctx)?;
    let theme = CliTableTheme::detect();
    let mut table =
        theme.new_data_table(&["Branch", "Tags", "Atoms", "Pinned", "Pending", "Bags", "Size", "Last scan"]);
    for r in &rows {
        let path = if r.configured {
            r.path.clone()
        } else {
            format!("{} (not configured)", r.path)
        };
        table.add_row(vec![
            comfy_table::Cell::new(path),
            comfy_table::Cell::new(&r.tags),
            num_cell(r.atoms),
            num_cell(r.pinned),
            num_cell(r.pending),
            num_cell(r.bags),
            num_cell(format_bytes(r.bytes)),
            comfy_table::Cell::new(format_time(r.last_scan)),
        ]);
    }
    println!("{table}");
    Ok(0)
}

pub(crate) fn run_branch(ctx: &ArchiveContext, selector: &str) -> CmdResult {
    let atoms = show::branch(ctx, selector)?;
    let theme = CliTableTheme::detect();
    let mut table = theme.new_data_table(&["Atom", "Size", "Files", "Bags", "Pinned", "Uploaded"]);
    for a in &atoms {
        let bags: Vec<String> = a.record.bags.iter().map(|b| b.to_string()).collect();
        table.add_row(vec![
            comfy_table::Cell::new(&a.path),
            num_cell(format_bytes(a.record.size)),
            num_cell(a.record.file_count),
            comfy_table::Cell::new(if bags.is_empty() { "pending".into() } else { bags.join(",") }),
            comfy_table::Cell::new(if a.record.pinned { "yes" } else { "" }),
            comfy_table::Cell::new(format_time(a.record.last_upload)),
        ]);
    }
    println!("{table}");
    Ok(0)
}

pub(crate) fn run_bag(ctx: &ArchiveContext, id: &str) -> CmdResult {
    let id: BagId = id.parse()?;
    let view = show::bag(ctx, id)?;
    let currency = ctx.pricing().currency().to_string();
    let bag = &view.record;

    let theme = CliTableTheme::detect();
    let mut t = theme.new_kv_table();
    add_kv_row(&mut t, theme, "Bag", bag.id);
    add_kv_row(&mut t, theme, "Branch", &bag.branch);
    add_kv_row(&mut t, theme, "Key", &bag.remote_key);
    add_kv_row(&mut t, theme, "Manifest", &bag.manifest_key);
    add_kv_row(&mut t, theme, "Class", &bag.storage_class);
    add_kv_row(&mut t, theme, "Size", format_bytes(bag.size));
    add_kv_row(
        &mut t,
        theme,
        "Fill",
        format!(
            "{} of {}",
            format_bytes(bag.payload_size),
            format_bytes(bag.capacity)
        ),
    );
    add_kv_row(&mut t, theme, "Dead bytes", format_bytes(view.dead_bytes));
    if let Some(f) = bag.fragment {
        add_kv_row(&mut t, theme, "Fragment", format!("{} of {}", f.index + 1, f.count));
    }
    add_kv_row(&mut t, theme, "Compressed", bag.compressed);
    add_kv_row(&mut t, theme, "Encrypted", bag.encrypted);
    add_kv_row(&mut t, theme, "Uploaded", format_time(Some(bag.uploaded_at)));
    add_kv_row(&mut t, theme, "Age", format!("{} days", view.age_days));
    add_kv_row(
        &mut t,
        theme,
        "Retention left",
        format!(
            "{} days (delete now: {})",
            view.retention_days_left,
            format_money(view.early_delete_penalty, &currency)
        ),
    );
    add_kv_row(&mut t, theme, "Atoms", view.live_atoms.join("\n"));
    println!("{t}");
    Ok(0)
}

pub(crate) fn run_atom(ctx: &ArchiveContext, path: &str) -> CmdResult {
    let (branch, view) = show::atom(ctx, path)?;
    let a = &view.record;
    let theme = CliTableTheme::detect();
    let mut t = theme.new_kv_table();
    add_kv_row(&mut t, theme, "Atom", &view.path);
    add_kv_row(&mut t, theme, "Branch", branch);
    add_kv_row(&mut t, theme, "Fingerprint", &a.fingerprint);
    add_kv_row(&mut t, theme, "Size", format_bytes(a.size));
    add_kv_row(&mut t, theme, "Files", a.file_count);
    let bags: Vec<String> = a.bags.iter().map(|b| b.to_string()).collect();
    add_kv_row(
        &mut t,
        theme,
        "Bags",
        if bags.is_empty() { "pending upload".to_string() } else { bags.join(", ") },
    );
    add_kv_row(&mut t, theme, "Pinned", a.pinned);
    add_kv_row(&mut t, theme, "Last upload", format_time(a.last_upload));
    println!("{t}");
    Ok(0)
}

pub(crate) fn run_report(ctx: &ArchiveContext) -> CmdResult {
    let r = show::report(ctx)?;
    let currency = ctx.pricing().currency().to_string();
    let theme = CliTableTheme::detect();

    let mut t = theme.new_kv_table();
    add_kv_row(&mut t, theme, "Bags", r.bag_count);
    add_kv_row(&mut t, theme, "Stored", format_bytes(r.stored_bytes));
    add_kv_row(&mut t, theme, "Live", format_bytes(r.live_bytes));
    add_kv_row(&mut t, theme, "Dead", format_bytes(r.dead_bytes));
    add_kv_row(
        &mut t,
        theme,
        "Superseded",
        format!("{} bag(s), {}", r.superseded_bags, format_bytes(r.superseded_bytes)),
    );
    add_kv_row(&mut t, theme, "Waste", format!("{:.1}%", r.waste_pct));
    add_kv_row(&mut t, theme, "Monthly cost", format_money(r.monthly_cost, &currency));
    add_kv_row(&mut t, theme, "Repack penalty", format_money(r.repack_penalty, &currency));
    add_kv_row(
        &mut t,
        theme,
        "Full retrieval",
        format!(
            "{} standard, {} bulk",
            format_money(r.retrieval_standard, &currency),
            format_money(r.retrieval_bulk, &currency)
        ),
    );
    println!("{t}");
    println!();

    let mut fills = theme.new_data_table(&["Bag", "Branch", "Size", "Dead", "Fill"]);
    for f in &r.fills {
        fills.add_row(vec![
            comfy_table::Cell::new(f.id),
            comfy_table::Cell::new(&f.branch),
            num_cell(format_bytes(f.size)),
            num_cell(format_bytes(f.dead)),
            num_cell(format!("{:.0}%", f.fill * 100.0)),
        ]);
    }
    println!("{fills}");
    Ok(0)
}
