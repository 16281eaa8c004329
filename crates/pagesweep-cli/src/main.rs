//! pagesweep - sweep every page of a paginated search API across many partitions
//!
//! Writes each partition's kept items as JSON plus a run summary, with an
//! adaptive rate limit, retries, a response cache and a request log.

use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};

mod cmd;
mod config;

use config::Config;
use pagesweep_core::shutdown_flag;

#[derive(Parser)]
#[command(name = "pagesweep")]
#[command(about = "Concurrent sweeps over paginated search APIs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Config file path (default: ./pagesweep.toml or ~/.config/pagesweep/config.toml)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch every page of the given partitions
    Run(cmd::run::RunArgs),
    /// Compute page counts for item totals
    Pages(cmd::pages::PagesArgs),
    /// Inspect or clear the response cache
    Cache(cmd::cache::CacheArgs),
    /// Show current configuration
    Config,
}

fn setup_signal_handler() -> Result<()> {
    // First signal: stop starting partitions. Second: exit immediately.
    // SAFETY: AtomicBool::swap and process::exit are async-signal-safe
    for signal in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        unsafe {
            signal_hook::low_level::register(signal, || {
                if shutdown_flag().swap(true, Ordering::Relaxed) {
                    std::process::exit(130);
                }
            })?;
        }
    }
    Ok(())
}

fn show_config(config: &Config) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Setting").fg(Color::Cyan),
            Cell::new("Value").fg(Color::Cyan),
        ]);

    table.add_row(vec!["API base URL", &config.api.base_url]);
    table.add_row(vec![
        "Request timeout",
        &format!("{}s", config.api.request_timeout),
    ]);
    table.add_row(vec![
        "Headers",
        &if config.api.headers.is_empty() {
            "none".to_string()
        } else {
            format!("{} configured", config.api.headers.len())
        },
    ]);
    table.add_row(vec![
        "Partitions",
        &if config.sweep.partitions.is_empty() {
            "none (pass on command line)".to_string()
        } else {
            config.sweep.partitions.join(", ")
        },
    ]);
    table.add_row(vec!["Page size", &config.sweep.page_size.to_string()]);
    table.add_row(vec![
        "Workers",
        &format!(
            "{} partitions x {} pages",
            config.sweep.partition_workers, config.sweep.page_workers
        ),
    ]);
    table.add_row(vec![
        "Rate",
        &format!(
            "{} req/s (min {}, max {})",
            config.rate.initial, config.rate.min, config.rate.max
        ),
    ]);
    table.add_row(vec!["Max attempts", &config.retry.max_retries.to_string()]);
    table.add_row(vec![
        "Partition timeout",
        &format!("{}s", config.sweep.partition_timeout),
    ]);
    table.add_row(vec![
        "Cache",
        &if config.cache.enabled {
            config.cache.dir.display().to_string()
        } else {
            "disabled".to_string()
        },
    ]);
    table.add_row(vec![
        "Request log",
        &format!(
            "{} (batch {})",
            config.log.path.display(),
            config.log.batch_size
        ),
    ]);
    table.add_row(vec!["Output directory", &config.output.dir.display().to_string()]);

    eprintln!("\n{table}");
}

fn run(cli: Cli, progress: &pagesweep_core::SharedProgress) -> Result<ExitCode> {
    let config = if let Some(path) = &cli.config {
        Config::from_file(path)?
    } else {
        Config::load()?
    };

    match cli.command {
        Command::Run(args) => {
            setup_signal_handler()?;
            cmd::run::run(args, &config, progress)
        }
        Command::Pages(args) => cmd::pages::run(args, &config).map(|()| ExitCode::SUCCESS),
        Command::Cache(args) => cmd::cache::run(args, &config).map(|()| ExitCode::SUCCESS),
        Command::Config => {
            show_config(&config);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Progress context (TTY auto-detect)
    let progress = Arc::new(pagesweep_core::ProgressContext::new());

    // Logging:
    //   TTY:     quiet (warn) unless --debug  - progress bars show activity
    //   non-TTY: info unless --debug          - logs are the only progress indicator
    let is_tty = progress.is_tty();
    let multi = if is_tty { Some(progress.multi()) } else { None };
    let quiet = is_tty && !cli.debug;
    pagesweep_core::init_logging(quiet, cli.debug, multi);

    match run(cli, &progress) {
        Ok(code) => code,
        Err(e) => {
            log::error!("Fatal error: {e:#}");
            ExitCode::from(2)
        }
    }
}
