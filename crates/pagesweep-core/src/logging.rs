//! Diagnostic log output that coexists with partition progress bars

use indicatif::MultiProgress;
use log::Level;

const RESET: &str = "\x1b[0m";

/// Fixed-width level tag, so messages line up in a scrolling terminal
fn label(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN ",
        Level::Info => "INFO ",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

fn ansi(level: Level) -> &'static str {
    match level {
        Level::Error => "\x1b[31m",
        Level::Warn => "\x1b[33m",
        Level::Info => "\x1b[32m",
        Level::Debug => "\x1b[36m",
        Level::Trace => "\x1b[35m",
    }
}

/// `[LEVEL] message`, with the tag colored on a terminal.
fn render(level: Level, args: &std::fmt::Arguments<'_>, colored: bool) -> String {
    if colored {
        format!("[{}{}{RESET}] {args}", ansi(level), label(level))
    } else {
        format!("[{}] {args}", label(level))
    }
}

/// Prints above the partition bars instead of through them.
pub struct IndicatifLogger {
    filter: env_logger::Logger,
    bars: MultiProgress,
}

impl IndicatifLogger {
    pub fn new(filter: env_logger::Logger, bars: MultiProgress) -> Self {
        Self { filter, bars }
    }
}

impl log::Log for IndicatifLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.filter.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if !self.filter.enabled(record.metadata()) {
            return;
        }
        let line = render(record.level(), record.args(), true);
        self.bars.suspend(|| eprintln!("{line}"));
    }

    fn flush(&self) {
        self.filter.flush();
    }
}

/// Install the global logger. `RUST_LOG` overrides the default level
/// (`debug` with `debug`, else `warn` when `quiet`, else `info`).
///
/// Pass the progress bars on a TTY; without them lines are plain text for
/// log files and pipes. Only the first call installs anything.
pub fn init_logging(quiet: bool, debug: bool, bars: Option<&MultiProgress>) {
    use std::io::Write;

    let default_level = match (debug, quiet) {
        (true, _) => "debug",
        (false, true) => "warn",
        (false, false) => "info",
    };
    let env = env_logger::Env::default().default_filter_or(default_level);

    let Some(bars) = bars else {
        let _ = env_logger::Builder::from_env(env)
            .format(|buf, record| writeln!(buf, "{}", render(record.level(), record.args(), false)))
            .try_init();
        return;
    };

    let filter = env_logger::Builder::from_env(env).build();
    let max_level = filter.filter();
    if log::set_boxed_logger(Box::new(IndicatifLogger::new(filter, bars.clone()))).is_ok() {
        log::set_max_level(max_level);
    }
}
