//! Engine façade: one validated configuration wired into the full stack

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::ResponseCache;
use crate::client::PageClient;
use crate::discovery::DEFAULT_MAX_PAGES;
use crate::error::SweepError;
use crate::fetcher::PageFetcher;
use crate::filter::{keep_all, ItemFilter};
use crate::limiter::{AdaptiveRateLimiter, RateLimitConfig};
use crate::pages::PagePool;
use crate::partition::Orchestrator;
use crate::partitions::{PartitionPool, PartitionReport, RunReport};
use crate::progress::SharedProgress;
use crate::request::FetchRequest;
use crate::request_log::{LogSink, RequestLog};
use crate::retry::{RetryConfig, RetryPolicy};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub page_size: u32,
    /// Empty means unbounded
    pub date_range_start: String,
    pub date_range_end: String,
    /// Extra query parameters sent with every request
    pub extra_filters: BTreeMap<String, String>,
    /// Concurrent page fetches per partition
    pub page_workers: usize,
    /// Concurrent partitions
    pub partition_workers: usize,
    pub rate: RateLimitConfig,
    pub retry: RetryConfig,
    pub partition_timeout: Duration,
    /// Bound on the whole run; `None` waits for every partition
    pub run_timeout: Option<Duration>,
    pub log_batch_size: usize,
    /// Partitions reporting more pages than this fail at discovery
    pub max_pages: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            date_range_start: String::new(),
            date_range_end: String::new(),
            extra_filters: BTreeMap::new(),
            page_workers: 3,
            partition_workers: 3,
            rate: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            partition_timeout: Duration::from_secs(1800),
            run_timeout: None,
            log_batch_size: 50,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), SweepError> {
        if self.page_size == 0 {
            return Err(SweepError::config("page_size must be > 0"));
        }
        if self.page_workers == 0 {
            return Err(SweepError::config("page_workers must be >= 1"));
        }
        if self.partition_workers == 0 {
            return Err(SweepError::config("partition_workers must be >= 1"));
        }
        if self.log_batch_size == 0 {
            return Err(SweepError::config("log_batch_size must be >= 1"));
        }
        if self.max_pages == 0 {
            return Err(SweepError::config("max_pages must be >= 1"));
        }
        if self.partition_timeout.is_zero() {
            return Err(SweepError::config("partition_timeout must be > 0"));
        }
        self.rate.validate()?;
        self.retry.validate()
    }

    /// Page-1 request shared by every partition (partition key left empty).
    pub fn template(&self) -> FetchRequest {
        FetchRequest {
            partition_key: String::new(),
            page: 1,
            page_size: self.page_size,
            date_range_start: self.date_range_start.clone(),
            date_range_end: self.date_range_end.clone(),
            extra_filters: self.extra_filters.clone(),
        }
    }
}

/// Owns the shared limiter, cache and request log for a sequence of runs.
pub struct Engine {
    config: EngineConfig,
    fetcher: Arc<dyn PageFetcher>,
    limiter: Arc<AdaptiveRateLimiter>,
    cache: Option<Arc<dyn ResponseCache>>,
    request_log: Option<Arc<RequestLog>>,
    filter: ItemFilter,
    progress: Option<SharedProgress>,
}

impl Engine {
    pub fn new(config: EngineConfig, fetcher: Arc<dyn PageFetcher>) -> Result<Self, SweepError> {
        config.validate()?;
        let limiter = Arc::new(AdaptiveRateLimiter::new(config.rate.clone())?);
        Ok(Self {
            config,
            fetcher,
            limiter,
            cache: None,
            request_log: None,
            filter: keep_all(),
            progress: None,
        })
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Batch telemetry into `sink`, `log_batch_size` records at a time.
    pub fn with_request_log(mut self, sink: impl LogSink + 'static) -> Self {
        self.request_log = Some(Arc::new(RequestLog::new(sink, self.config.log_batch_size)));
        self
    }

    pub fn with_item_filter(mut self, filter: ItemFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_progress(mut self, progress: SharedProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn limiter(&self) -> &AdaptiveRateLimiter {
        &self.limiter
    }

    pub fn request_log(&self) -> Option<&RequestLog> {
        self.request_log.as_deref()
    }

    /// The cache → limiter → retry stack used for every page.
    pub fn client(&self) -> PageClient {
        let mut client = PageClient::new(
            self.fetcher.clone(),
            self.limiter.clone(),
            RetryPolicy::new(self.config.retry.clone()),
        );
        if let Some(cache) = &self.cache {
            client = client.with_cache(cache.clone());
        }
        if let Some(log) = &self.request_log {
            client = client.with_request_log(log.clone());
        }
        client
    }

    /// Sweep every partition. Reports stream to `on_report` as partitions
    /// finish; the request log is flushed before returning.
    pub fn run(
        &self,
        partitions: Vec<String>,
        on_report: impl FnMut(&PartitionReport),
    ) -> Result<RunReport, SweepError> {
        let pool = PartitionPool::new(self.config.partition_workers, self.config.run_timeout)?;
        let mut orchestrator = Orchestrator::new(
            Arc::new(self.client()),
            PagePool::new(self.config.page_workers),
            self.config.template(),
            self.filter.clone(),
            self.config.partition_timeout,
        )
        .with_max_pages(self.config.max_pages);
        if let Some(progress) = &self.progress {
            orchestrator = orchestrator.with_progress(progress.clone());
        }

        log::info!(
            "sweeping {} partitions ({} at a time, {} pages each, {:.1} req/s)",
            partitions.len(),
            pool.workers(),
            self.config.page_workers,
            self.limiter.current_rate()
        );
        let report = pool.run(partitions, Arc::new(orchestrator), on_report);

        if let Some(log) = &self.request_log {
            match log.flush() {
                Ok(n) => log::debug!("request log: flushed {n} records"),
                Err(e) => log::warn!("request log flush failed: {e}"),
            }
        }
        Ok(report)
    }
}
