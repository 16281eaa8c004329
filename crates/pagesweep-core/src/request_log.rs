//! Batched append-only telemetry of network fetches

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::request::{FetchRequest, FetchResult, Outcome};

/// One network fetch, as persisted in the request log.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Local>,
    pub partition_key: String,
    pub page: u32,
    pub url: String,
    pub params: BTreeMap<String, String>,
    /// `success` or the failure kind
    pub outcome: &'static str,
    pub http_status: Option<u16>,
    pub latency_ms: f64,
    pub attempts: u32,
    pub error: Option<String>,
    pub items_returned: usize,
    pub total_available: Option<u64>,
}

impl LogRecord {
    pub fn new(
        request: &FetchRequest,
        url: String,
        params: BTreeMap<String, String>,
        result: &FetchResult,
    ) -> Self {
        let outcome = match result.outcome {
            Outcome::Success => "success",
            Outcome::Failure(kind) => kind.as_str(),
        };
        Self {
            timestamp: Local::now(),
            partition_key: request.partition_key.clone(),
            page: request.page,
            url,
            params,
            outcome,
            http_status: result.http_status,
            latency_ms: result.latency.as_secs_f64() * 1000.0,
            attempts: result.attempts,
            error: result.error.clone(),
            items_returned: result.item_count(),
            total_available: result.total_available(),
        }
    }
}

/// Durable destination for serialized records.
pub trait LogSink: Send {
    /// Persist all lines or fail without partial acknowledgement.
    fn write_lines(&mut self, lines: &[String]) -> io::Result<()>;
}

/// Appends newline-delimited JSON to a file.
#[derive(Debug, Clone)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drop any previous log content.
    pub fn truncate(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Write `bytes` in full, or undo whatever part of them landed.
fn write_or_rollback<W: Write>(
    w: &mut W,
    bytes: &[u8],
    rollback: impl FnOnce(&mut W) -> io::Result<()>,
) -> io::Result<()> {
    let Err(e) = w.write_all(bytes).and_then(|()| w.flush()) else {
        return Ok(());
    };
    if let Err(re) = rollback(w) {
        log::error!("request log: partial batch left on disk: {re}");
    }
    Err(e)
}

impl LogSink for JsonlSink {
    fn write_lines(&mut self, lines: &[String]) -> io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut batch = Vec::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines {
            batch.extend_from_slice(line.as_bytes());
            batch.push(b'\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let start = file.metadata()?.len();
        write_or_rollback(&mut file, &batch, |f| f.set_len(start))
    }
}

struct Buffer {
    records: Vec<LogRecord>,
    sink: Box<dyn LogSink>,
    flushes: usize,
}

impl Buffer {
    fn flush(&mut self) -> io::Result<usize> {
        if self.records.is_empty() {
            return Ok(0);
        }
        let lines = self
            .records
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        self.sink.write_lines(&lines)?;
        let n = self.records.len();
        self.records.clear();
        self.flushes += 1;
        Ok(n)
    }
}

/// Buffers records and writes them to the sink in batches.
///
/// A failed flush keeps the buffered records for the next attempt.
pub struct RequestLog {
    batch_size: usize,
    inner: Mutex<Buffer>,
}

impl RequestLog {
    pub fn new(sink: impl LogSink + 'static, batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            inner: Mutex::new(Buffer {
                records: Vec::with_capacity(batch_size.max(1)),
                sink: Box::new(sink),
                flushes: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buffer> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, record: LogRecord) {
        let mut buf = self.lock();
        buf.records.push(record);
        if buf.records.len() >= self.batch_size {
            if let Err(e) = buf.flush() {
                log::warn!(
                    "request log flush failed ({} records kept): {e}",
                    buf.records.len()
                );
            }
        }
    }

    /// Write out everything buffered. Returns the number of records written.
    pub fn flush(&self) -> io::Result<usize> {
        self.lock().flush()
    }

    /// Records waiting for the next flush
    pub fn pending(&self) -> usize {
        self.lock().records.len()
    }

    /// Successful flushes so far
    pub fn flushes(&self) -> usize {
        self.lock().flushes
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl Drop for RequestLog {
    fn drop(&mut self) {
        let buf = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = buf.flush() {
            log::error!("request log: {} records lost: {e}", buf.records.len());
        }
    }
}
