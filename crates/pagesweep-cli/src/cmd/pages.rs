//! `pagesweep pages` - page counts for given item totals

use anyhow::Result;
use clap::Args;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};

use pagesweep_core::{fmt_num, total_pages};

use crate::config::Config;

#[derive(Args, Debug)]
pub struct PagesArgs {
    /// Item totals as reported by the API's `count`
    #[arg(required = true)]
    pub totals: Vec<u64>,

    /// Items per page (default: from config)
    #[arg(long)]
    pub page_size: Option<u32>,
}

/// Items on the last page of `total` split into pages of `page_size`.
fn last_page_items(total: u64, page_size: u32) -> u64 {
    match total % u64::from(page_size) {
        0 if total > 0 => u64::from(page_size),
        rem => rem,
    }
}

pub fn run(args: PagesArgs, config: &Config) -> Result<()> {
    let page_size = args.page_size.unwrap_or(config.sweep.page_size);

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Items").fg(Color::Cyan),
            Cell::new("Page size").fg(Color::Cyan),
            Cell::new("Pages").fg(Color::Cyan),
            Cell::new("Last page").fg(Color::Cyan),
        ]);

    for &total in &args.totals {
        let pages = total_pages(total, page_size)?;
        table.add_row(vec![
            Cell::new(fmt_num(total as usize)),
            Cell::new(page_size),
            Cell::new(fmt_num(pages as usize)),
            Cell::new(format!("{} items", last_page_items(total, page_size))),
        ]);
        println!("{pages}");
    }

    eprintln!("\n{table}");
    Ok(())
}
