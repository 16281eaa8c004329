//! One partition: discovery, concurrent page fetching, aggregation, deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::ProgressBar;
use serde::Serialize;
use serde_json::Value;

use crate::client::PageClient;
use crate::discovery::{discover, DiscoveryError, DEFAULT_MAX_PAGES};
use crate::error::FailureKind;
use crate::filter::ItemFilter;
use crate::pages::{Drain, PageDone, PagePool};
use crate::progress::{upgrade_to_pages, SharedProgress};
use crate::request::FetchRequest;

/// Stand-in for "no deadline" when a timeout would overflow `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

pub(crate) fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionState {
    Discovering,
    Fetching,
    Completed,
    TimedOut,
    Failed,
}

impl PartitionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovering => "discovering",
            Self::Fetching => "fetching",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PartitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PageError {
    pub page: u32,
    pub kind: FailureKind,
    pub message: String,
}

/// Terminal result of one partition, handed to the output sink.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionOutcome {
    pub partition_key: String,
    pub state: PartitionState,
    pub total_items: u64,
    pub total_pages: u32,
    pub pages_completed: u32,
    pub pages_failed: u32,
    pub results: Vec<Value>,
    pub errors: Vec<PageError>,
    pub elapsed_secs: f64,
}

/// Running accumulator for one partition.
///
/// `pages_completed + pages_failed <= total_pages` holds after every update.
#[derive(Debug)]
pub struct PartitionTask {
    pub partition_key: String,
    pub total_pages: u32,
    pub pages_completed: u32,
    pub pages_failed: u32,
    pub results: Vec<Value>,
    pub errors: Vec<PageError>,
    pub start_time: Instant,
    pub deadline: Instant,
}

impl PartitionTask {
    pub fn new(partition_key: &str, timeout: Duration) -> Self {
        let start_time = Instant::now();
        Self {
            partition_key: partition_key.to_string(),
            total_pages: 0,
            pages_completed: 0,
            pages_failed: 0,
            results: Vec::new(),
            errors: Vec::new(),
            start_time,
            deadline: deadline_after(start_time, timeout),
        }
    }

    /// Fold one finished page in.
    pub fn record(&mut self, done: PageDone) {
        match done.result.failure_kind() {
            None => {
                self.pages_completed += 1;
                self.results.extend(done.kept);
            }
            Some(kind) => {
                self.pages_failed += 1;
                self.errors.push(PageError {
                    page: done.page,
                    kind,
                    message: done.result.error.unwrap_or_default(),
                });
            }
        }
        debug_assert!(self.pages_completed + self.pages_failed <= self.total_pages);
    }

    /// Record pages that never produced a result.
    pub fn give_up(&mut self, pages: &[u32], kind: FailureKind, message: &str) {
        for &page in pages {
            self.pages_failed += 1;
            self.errors.push(PageError {
                page,
                kind,
                message: message.to_string(),
            });
        }
        debug_assert!(self.pages_completed + self.pages_failed <= self.total_pages);
    }

    pub fn finish(self, state: PartitionState, total_items: u64) -> PartitionOutcome {
        PartitionOutcome {
            partition_key: self.partition_key,
            state,
            total_items,
            total_pages: self.total_pages,
            pages_completed: self.pages_completed,
            pages_failed: self.pages_failed,
            results: self.results,
            errors: self.errors,
            elapsed_secs: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

/// Drives partitions through Discovering → Fetching → terminal state.
///
/// Shared by every partition worker; holds no per-partition state.
pub struct Orchestrator {
    client: Arc<PageClient>,
    pages: PagePool,
    /// Request for page 1 with an empty partition key
    template: FetchRequest,
    filter: ItemFilter,
    partition_timeout: Duration,
    max_pages: u32,
    progress: Option<SharedProgress>,
}

impl Orchestrator {
    pub fn new(
        client: Arc<PageClient>,
        pages: PagePool,
        template: FetchRequest,
        filter: ItemFilter,
        partition_timeout: Duration,
    ) -> Self {
        Self {
            client,
            pages,
            template,
            filter,
            partition_timeout,
            max_pages: DEFAULT_MAX_PAGES,
            progress: None,
        }
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_progress(mut self, progress: SharedProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    fn bar(&self, key: &str) -> ProgressBar {
        match &self.progress {
            Some(p) => p.partition_bar(key),
            None => ProgressBar::hidden(),
        }
    }

    /// Run one partition to a terminal state. Never fails for expected
    /// failure kinds; those end up in `errors`.
    pub fn run(&self, partition_key: &str) -> PartitionOutcome {
        let mut task = PartitionTask::new(partition_key, self.partition_timeout);
        let request = FetchRequest {
            partition_key: partition_key.to_string(),
            ..self.template.clone()
        };
        let pb = self.bar(partition_key);
        log::debug!("{partition_key}: {}", PartitionState::Discovering);

        let discovery = match discover(&self.client, &request, self.max_pages) {
            Ok(d) => d,
            Err(e) => {
                let kind = match &e {
                    DiscoveryError::InvalidConfiguration(_) => FailureKind::InvalidConfiguration,
                    DiscoveryError::Fetch(r) => r.failure_kind().unwrap_or(FailureKind::Unexpected),
                    DiscoveryError::TooManyPages { .. } => FailureKind::InvalidResponseSchema,
                };
                log::warn!("{partition_key}: discovery failed: {e}");
                // total is unknown, so this does not count as a failed page
                task.errors.push(PageError {
                    page: 1,
                    kind,
                    message: e.to_string(),
                });
                pb.finish_and_clear();
                return task.finish(PartitionState::Failed, 0);
            }
        };

        let total_items = discovery.total_items;
        task.total_pages = discovery.total_pages;
        if task.total_pages == 0 {
            log::info!("{partition_key}: no items");
            pb.finish_and_clear();
            return task.finish(PartitionState::Completed, 0);
        }

        upgrade_to_pages(&pb, u64::from(task.total_pages));
        let mut first = discovery.first_page;
        let items = first
            .page
            .as_mut()
            .map(|p| std::mem::take(&mut p.items))
            .unwrap_or_default();
        let returned = items.len();
        let kept = items.into_iter().filter(|item| (self.filter)(item)).collect();
        task.record(PageDone {
            page: 1,
            result: first,
            returned,
            kept,
        });
        pb.inc(1);

        log::debug!(
            "{partition_key}: {} ({} pages)",
            PartitionState::Fetching,
            task.total_pages
        );
        let remaining = 2..=task.total_pages;
        let state = if Instant::now() >= task.deadline {
            let late: Vec<u32> = remaining.collect();
            task.give_up(&late, FailureKind::Timeout, "partition deadline passed during discovery");
            PartitionState::TimedOut
        } else {
            let deadline = task.deadline;
            let drain = self
                .pages
                .run(&self.client, &request, remaining, &self.filter, deadline, |done| {
                    task.record(done);
                    pb.inc(1);
                    pb.set_message(format!("{} items", task.results.len()));
                });
            match drain {
                Drain::Finished { lost } if lost.is_empty() => PartitionState::Completed,
                Drain::Finished { lost } => {
                    log::error!("{partition_key}: {} pages lost to a crashed worker", lost.len());
                    task.give_up(&lost, FailureKind::Unexpected, "page worker exited without a result");
                    PartitionState::Completed
                }
                Drain::DeadlineElapsed { outstanding } => {
                    log::warn!(
                        "{partition_key}: timed out after {:.0}s, {} pages abandoned",
                        self.partition_timeout.as_secs_f64(),
                        outstanding.len()
                    );
                    task.give_up(&outstanding, FailureKind::Timeout, "abandoned at partition deadline");
                    PartitionState::TimedOut
                }
            }
        };

        pb.finish_and_clear();
        let outcome = task.finish(state, total_items);
        log::info!(
            "{partition_key}: {} {}/{} pages, {} items kept, {} errors in {:.1}s",
            outcome.state,
            outcome.pages_completed,
            outcome.total_pages,
            outcome.results.len(),
            outcome.errors.len(),
            outcome.elapsed_secs
        );
        outcome
    }
}
