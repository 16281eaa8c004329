//! Bounded-concurrency page fetching within one partition

use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::client::PageClient;
use crate::filter::ItemFilter;
use crate::request::{FetchRequest, FetchResult};
use crate::work_queue::WorkQueue;

/// One page's terminal result, reported in completion order.
#[derive(Debug)]
pub struct PageDone {
    pub page: u32,
    /// `page.items` has been moved into `kept`/filtered out
    pub result: FetchResult,
    /// Items returned by the server before filtering
    pub returned: usize,
    pub kept: Vec<Value>,
}

/// How the pool stopped.
#[derive(Debug, PartialEq, Eq)]
pub enum Drain {
    /// Every worker exited. `lost` holds pages claimed by a worker that died
    /// before reporting.
    Finished { lost: Vec<u32> },
    /// The deadline passed first. The queue was closed and `outstanding`
    /// pages (claimed or not) are abandoned; late results are discarded.
    DeadlineElapsed { outstanding: Vec<u32> },
}

/// Runs at most `workers` page fetches at once.
#[derive(Debug, Clone, Copy)]
pub struct PagePool {
    workers: usize,
}

impl PagePool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Fetch every page in `pages`, calling `on_done` on this thread as each
    /// one finishes. Returns no later than `deadline` (plus scheduling noise).
    pub fn run(
        &self,
        client: &Arc<PageClient>,
        template: &FetchRequest,
        pages: RangeInclusive<u32>,
        filter: &ItemFilter,
        deadline: Instant,
        mut on_done: impl FnMut(PageDone),
    ) -> Drain {
        let mut pending: BTreeSet<u32> = pages.clone().collect();
        if pending.is_empty() {
            return Drain::Finished { lost: Vec::new() };
        }
        let queue = Arc::new(WorkQueue::new(pages.collect()));
        let (tx, rx) = mpsc::channel::<PageDone>();

        let n = self.workers.min(queue.total());
        for i in 0..n {
            let queue = queue.clone();
            let client = client.clone();
            let request = template.clone();
            let filter = filter.clone();
            let tx = tx.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("{}-page-{i}", template.partition_key))
                .spawn(move || {
                    while let Some(&page) = queue.next() {
                        let mut result = client.fetch(&request.for_page(page));
                        let items = result
                            .page
                            .as_mut()
                            .map(|p| std::mem::take(&mut p.items))
                            .unwrap_or_default();
                        let returned = items.len();
                        let kept = items.into_iter().filter(|item| filter(item)).collect();
                        let done = PageDone {
                            page,
                            result,
                            returned,
                            kept,
                        };
                        if tx.send(done).is_err() {
                            break;
                        }
                    }
                });
            if let Err(e) = spawned {
                log::error!("{}: failed to spawn page worker: {e}", template.partition_key);
                break;
            }
        }
        drop(tx);

        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(wait) {
                Ok(done) => {
                    pending.remove(&done.page);
                    on_done(done);
                }
                Err(RecvTimeoutError::Timeout) => {
                    queue.close();
                    return Drain::DeadlineElapsed {
                        outstanding: pending.into_iter().collect(),
                    };
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Drain::Finished {
                        lost: pending.into_iter().collect(),
                    };
                }
            }
        }
    }
}
