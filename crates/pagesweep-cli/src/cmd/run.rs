//! `pagesweep run` - sweep partitions and write their items as JSON

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::Args;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use serde::Serialize;

use pagesweep_core::{
    fmt_num, is_shutdown_requested, DirCache, Engine, EngineConfig, FieldFilter, HttpConfig,
    HttpFetcher, JsonlSink, PartitionOutcome, PartitionReport, PartitionState, RunReport,
    SharedProgress,
};

use crate::config::Config;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Partition keys (default: [sweep].partitions from config)
    pub partitions: Vec<String>,

    /// First availability date, YYYY-MM-DD
    #[arg(long)]
    pub start: Option<NaiveDate>,

    /// Last availability date, YYYY-MM-DD (default: same as --start)
    #[arg(long)]
    pub end: Option<NaiveDate>,

    /// Items per page
    #[arg(long)]
    pub page_size: Option<u32>,

    /// Concurrent page fetches per partition
    #[arg(long)]
    pub page_workers: Option<usize>,

    /// Concurrent partitions
    #[arg(long)]
    pub partition_workers: Option<usize>,

    /// Starting (and maximum) requests per second
    #[arg(long)]
    pub rps: Option<f64>,

    /// Extra query parameter sent with every request (repeatable)
    #[arg(long = "param", value_name = "NAME=VALUE", value_parser = parse_key_val)]
    pub params: Vec<(String, String)>,

    /// Keep only items whose FIELD equals VALUE (repeatable)
    #[arg(long = "keep", value_name = "FIELD=VALUE", value_parser = parse_key_val)]
    pub keep: Vec<(String, String)>,

    /// Bypass the response cache
    #[arg(long)]
    pub no_cache: bool,

    /// Output directory (default: from config)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected NAME=VALUE, got {s:?}")),
    }
}

/// Resolve the date range. A lone `--start` means that single day.
fn date_range(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Result<(String, String)> {
    let fmt = |d: NaiveDate| d.format("%Y-%m-%d").to_string();
    match (start, end) {
        (Some(s), Some(e)) if s > e => bail!("--start {s} is after --end {e}"),
        (Some(s), Some(e)) => Ok((fmt(s), fmt(e))),
        (Some(s), None) => Ok((fmt(s), fmt(s))),
        (None, Some(_)) => bail!("--end requires --start"),
        (None, None) => Ok((String::new(), String::new())),
    }
}

fn engine_config(args: &RunArgs, config: &Config) -> Result<EngineConfig> {
    let (date_range_start, date_range_end) = date_range(args.start, args.end)?;
    let mut extra_filters = config.sweep.params.clone();
    extra_filters.extend(args.params.iter().cloned());

    let mut rate = config.rate.to_limits();
    if let Some(rps) = args.rps {
        rate.initial_rate = rps;
        rate.max_rate = rps;
        rate.min_rate = rate.min_rate.min(rps);
    }

    Ok(EngineConfig {
        page_size: args.page_size.unwrap_or(config.sweep.page_size),
        date_range_start,
        date_range_end,
        extra_filters,
        page_workers: args.page_workers.unwrap_or(config.sweep.page_workers),
        partition_workers: args
            .partition_workers
            .unwrap_or(config.sweep.partition_workers),
        rate,
        retry: config.retry.to_retry(),
        partition_timeout: Duration::from_secs(config.sweep.partition_timeout),
        run_timeout: config.sweep.run_timeout.map(Duration::from_secs),
        log_batch_size: config.log.batch_size,
        max_pages: config.sweep.max_pages,
    })
}

fn http_config(config: &Config) -> HttpConfig {
    let mut http = HttpConfig {
        base_url: config.api.base_url.clone(),
        query_names: config.api.query_names.clone(),
        request_timeout: Duration::from_secs(config.api.request_timeout),
        connect_timeout: Duration::from_secs(config.api.connect_timeout),
        max_connections: config.api.max_connections,
        headers: config.api.headers.clone(),
        ..Default::default()
    };
    if let Some(ua) = &config.api.user_agent {
        http.user_agent = ua.clone();
    }
    http
}

/// File name for a partition key. Bytes outside `[A-Za-z0-9_-]` are written
/// as `%XX`, so distinct keys never share a file.
fn file_stem(key: &str) -> String {
    let mut stem = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            stem.push(char::from(b));
        } else {
            stem.push_str(&format!("%{b:02X}"));
        }
    }
    stem
}

/// Partitions that kept items or hit errors get an output file.
fn has_output(outcome: &PartitionOutcome) -> bool {
    !outcome.results.is_empty() || !outcome.errors.is_empty()
}

/// Serialize to `<path>.tmp`, then rename into place.
fn write_json_atomic(path: &Path, value: &impl Serialize) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to rename {}", tmp.display()))?;
    Ok(())
}

#[derive(Serialize)]
struct PartitionSummary<'a> {
    partition_key: &'a str,
    state: &'a str,
    total_items: u64,
    total_pages: u32,
    pages_completed: u32,
    pages_failed: u32,
    items_kept: usize,
    errors: usize,
    elapsed_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    crash: Option<&'a str>,
}

impl<'a> PartitionSummary<'a> {
    fn from_report(report: &'a PartitionReport) -> Self {
        match &report.result {
            Ok(o) => Self {
                partition_key: &report.partition_key,
                state: o.state.as_str(),
                total_items: o.total_items,
                total_pages: o.total_pages,
                pages_completed: o.pages_completed,
                pages_failed: o.pages_failed,
                items_kept: o.results.len(),
                errors: o.errors.len(),
                elapsed_secs: o.elapsed_secs,
                crash: None,
            },
            Err(msg) => Self {
                partition_key: &report.partition_key,
                state: "crashed",
                total_items: 0,
                total_pages: 0,
                pages_completed: 0,
                pages_failed: 0,
                items_kept: 0,
                errors: 0,
                elapsed_secs: 0.0,
                crash: Some(msg),
            },
        }
    }
}

#[derive(Serialize)]
struct RunSummary<'a> {
    finished_at: String,
    elapsed_secs: f64,
    date_range_start: &'a str,
    date_range_end: &'a str,
    final_rate: f64,
    partitions: Vec<PartitionSummary<'a>>,
    incomplete: &'a [String],
}

fn print_summary(report: &RunReport) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Partition").fg(Color::Cyan),
            Cell::new("State").fg(Color::Cyan),
            Cell::new("Pages").fg(Color::Cyan),
            Cell::new("Failed").fg(Color::Cyan),
            Cell::new("Items").fg(Color::Cyan),
            Cell::new("Time").fg(Color::Cyan),
        ]);

    for r in &report.reports {
        let s = PartitionSummary::from_report(r);
        let color = match &r.result {
            Ok(o) if o.state == PartitionState::Completed && o.pages_failed == 0 => Color::Green,
            Ok(o) if o.state == PartitionState::Completed => Color::Yellow,
            _ => Color::Red,
        };
        table.add_row(vec![
            Cell::new(s.partition_key),
            Cell::new(s.state).fg(color),
            Cell::new(format!("{}/{}", s.pages_completed, s.total_pages)),
            Cell::new(s.pages_failed),
            Cell::new(fmt_num(s.items_kept)),
            Cell::new(format!("{:.1}s", s.elapsed_secs)),
        ]);
    }
    for key in &report.incomplete {
        table.add_row(vec![
            Cell::new(key),
            Cell::new("incomplete").fg(Color::DarkGrey),
            Cell::new("-"),
            Cell::new("-"),
            Cell::new("-"),
            Cell::new("-"),
        ]);
    }

    eprintln!("\n{table}");
    eprintln!(
        "{} items kept from {} partitions in {:.1}s",
        fmt_num(report.items_kept()),
        report.reports.len(),
        report.elapsed.as_secs_f64()
    );
}

pub fn run(args: RunArgs, config: &Config, progress: &SharedProgress) -> Result<ExitCode> {
    let partitions = if args.partitions.is_empty() {
        config.sweep.partitions.clone()
    } else {
        args.partitions.clone()
    };
    if partitions.is_empty() {
        bail!("no partitions given (pass keys or set [sweep].partitions)");
    }

    let engine_config = engine_config(&args, config)?;
    let fetcher = HttpFetcher::new(http_config(config))?;

    let mut keep = config.sweep.keep.clone();
    keep.extend(args.keep.iter().cloned());

    let sink = JsonlSink::new(&config.log.path);
    if config.log.truncate {
        sink.truncate()
            .with_context(|| format!("failed to reset {}", config.log.path.display()))?;
    }

    let mut engine = Engine::new(engine_config, Arc::new(fetcher))?
        .with_item_filter(FieldFilter::new(keep).into_item_filter())
        .with_request_log(sink)
        .with_progress(progress.clone());
    if config.cache.enabled && !args.no_cache {
        let cache = DirCache::new(&config.cache.dir)
            .with_context(|| format!("failed to open cache {}", config.cache.dir.display()))?;
        engine = engine.with_cache(Arc::new(cache));
    }

    let out_dir = args.output.clone().unwrap_or_else(|| config.output.dir.clone());
    fs::create_dir_all(&out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    let mut write_errors = 0usize;
    let report = engine.run(partitions, |r| {
        let Ok(outcome) = &r.result else { return };
        if !has_output(outcome) {
            return;
        }
        let path = out_dir.join(format!("{}.json", file_stem(&r.partition_key)));
        match write_json_atomic(&path, outcome) {
            Ok(()) => log::debug!("wrote {}", path.display()),
            Err(e) => {
                write_errors += 1;
                log::error!("{}: {e:#}", r.partition_key);
            }
        }
    })?;

    let sweep = engine.config();
    let summary = RunSummary {
        finished_at: Local::now().to_rfc3339(),
        elapsed_secs: report.elapsed.as_secs_f64(),
        date_range_start: &sweep.date_range_start,
        date_range_end: &sweep.date_range_end,
        final_rate: engine.limiter().current_rate(),
        partitions: report
            .reports
            .iter()
            .map(PartitionSummary::from_report)
            .collect(),
        incomplete: &report.incomplete,
    };
    write_json_atomic(&out_dir.join("summary.json"), &summary)?;
    print_summary(&report);

    let code = if is_shutdown_requested() {
        log::warn!("interrupted; {} partitions not run", report.incomplete.len());
        ExitCode::from(130)
    } else if report.all_completed() && write_errors == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    };
    Ok(code)
}
