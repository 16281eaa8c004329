//! Bounded-concurrency partition runs with crash isolation

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::SweepError;
use crate::partition::{deadline_after, Orchestrator, PartitionOutcome, PartitionState};
use crate::shutdown::is_shutdown_requested;
use crate::work_queue::WorkQueue;

/// Result for one partition key. `Err` carries the panic message of a crashed run.
#[derive(Debug)]
pub struct PartitionReport {
    pub partition_key: String,
    pub result: Result<PartitionOutcome, String>,
}

impl PartitionReport {
    pub fn is_completed(&self) -> bool {
        matches!(&self.result, Ok(o) if o.state == PartitionState::Completed)
    }
}

/// Everything one run produced, in completion order.
#[derive(Debug)]
pub struct RunReport {
    pub reports: Vec<PartitionReport>,
    /// Keys with no report: not started before shutdown, or still running
    /// when the run timeout elapsed
    pub incomplete: Vec<String>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn all_completed(&self) -> bool {
        self.incomplete.is_empty() && self.reports.iter().all(PartitionReport::is_completed)
    }

    pub fn items_kept(&self) -> usize {
        self.reports
            .iter()
            .filter_map(|r| r.result.as_ref().ok())
            .map(|o| o.results.len())
            .sum()
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs at most `workers` partitions at once on a dedicated rayon pool.
pub struct PartitionPool {
    pool: rayon::ThreadPool,
    workers: usize,
    run_timeout: Option<Duration>,
}

impl PartitionPool {
    pub fn new(workers: usize, run_timeout: Option<Duration>) -> Result<Self, SweepError> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("partition-{i}"))
            .build()
            .map_err(|e| SweepError::Io(std::io::Error::other(e)))?;
        Ok(Self {
            pool,
            workers,
            run_timeout,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run every key through `orchestrator`. `on_report` sees each report as
    /// it arrives. One partition's failure, timeout or panic never affects
    /// the others.
    pub fn run(
        &self,
        keys: Vec<String>,
        orchestrator: Arc<Orchestrator>,
        mut on_report: impl FnMut(&PartitionReport),
    ) -> RunReport {
        let started = Instant::now();
        let deadline = self.run_timeout.map(|t| deadline_after(started, t));
        let mut outstanding = keys.clone();
        let queue = Arc::new(WorkQueue::new(keys));
        let (tx, rx) = mpsc::channel::<PartitionReport>();

        for _ in 0..self.workers.min(queue.total()) {
            let queue = queue.clone();
            let orchestrator = orchestrator.clone();
            let tx = tx.clone();
            self.pool.spawn(move || {
                while let Some(key) = queue.next() {
                    if is_shutdown_requested() {
                        queue.close();
                        break;
                    }
                    let result = catch_unwind(AssertUnwindSafe(|| orchestrator.run(key)))
                        .map_err(panic_message);
                    if let Err(msg) = &result {
                        log::error!("{key}: partition crashed: {msg}");
                    }
                    let report = PartitionReport {
                        partition_key: key.clone(),
                        result,
                    };
                    if tx.send(report).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut reports = Vec::with_capacity(outstanding.len());
        loop {
            let received = match deadline {
                Some(d) => rx.recv_timeout(d.saturating_duration_since(Instant::now())),
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(report) => {
                    if let Some(i) = outstanding.iter().position(|k| *k == report.partition_key) {
                        outstanding.remove(i);
                    }
                    on_report(&report);
                    reports.push(report);
                }
                Err(RecvTimeoutError::Timeout) => {
                    queue.close();
                    log::warn!(
                        "run timeout elapsed with {} partitions outstanding",
                        outstanding.len()
                    );
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if !outstanding.is_empty() && is_shutdown_requested() {
            log::warn!("shutdown: {} partitions not run", outstanding.len());
        }
        RunReport {
            reports,
            incomplete: outstanding,
            elapsed: started.elapsed(),
        }
    }
}
