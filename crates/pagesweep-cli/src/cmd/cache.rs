//! `pagesweep cache` - inspect or clear the response cache

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use pagesweep_core::{fmt_num, DirCache};

use crate::config::Config;

#[derive(Args, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub action: CacheAction,

    /// Cache directory (default: from config)
    #[arg(short, long, global = true)]
    pub dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Show entry count and size
    Info,
    /// Delete every cached response
    Clear {
        /// Actually delete (otherwise dry-run)
        #[arg(long)]
        confirm: bool,
    },
}

pub fn run(args: CacheArgs, config: &Config) -> Result<()> {
    let dir = args.dir.unwrap_or_else(|| config.cache.dir.clone());
    if !dir.exists() {
        eprintln!("No cache at {}.", dir.display());
        return Ok(());
    }
    let cache = DirCache::new(&dir)
        .with_context(|| format!("failed to open cache {}", dir.display()))?;

    match args.action {
        CacheAction::Info => {
            let entries = cache.entries()?;
            let bytes = cache.size_bytes()?;
            eprintln!(
                "{}: {} entries, {} KiB",
                dir.display(),
                fmt_num(entries.len()),
                fmt_num((bytes / 1024) as usize)
            );
        }
        CacheAction::Clear { confirm: false } => {
            let n = cache.entries()?.len();
            eprintln!("Would remove {} entries from {}.", fmt_num(n), dir.display());
            eprintln!("Run with --confirm to actually delete.");
        }
        CacheAction::Clear { confirm: true } => {
            let n = cache.clear()?;
            eprintln!("Removed {} entries.", fmt_num(n));
        }
    }
    Ok(())
}
