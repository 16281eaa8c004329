//! Cache → rate limiter → retry composition around a [`PageFetcher`]

use std::sync::Arc;

use crate::cache::ResponseCache;
use crate::fetcher::PageFetcher;
use crate::limiter::AdaptiveRateLimiter;
use crate::request::{FetchRequest, FetchResult, PageResponse};
use crate::request_log::{LogRecord, RequestLog};
use crate::retry::RetryPolicy;

/// Fetches one page through the full stack.
///
/// A cache hit returns without taking a limiter token or writing a log record.
/// Every network fetch (successful or not) appends exactly one record.
#[derive(Clone)]
pub struct PageClient {
    fetcher: Arc<dyn PageFetcher>,
    limiter: Arc<AdaptiveRateLimiter>,
    retry: RetryPolicy,
    cache: Option<Arc<dyn ResponseCache>>,
    log: Option<Arc<RequestLog>>,
}

impl PageClient {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        limiter: Arc<AdaptiveRateLimiter>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            fetcher,
            limiter,
            retry,
            cache: None,
            log: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_request_log(mut self, log: Arc<RequestLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn limiter(&self) -> &AdaptiveRateLimiter {
        &self.limiter
    }

    fn cached(&self, key: &str, label: &str) -> Option<PageResponse> {
        let bytes = self.cache.as_ref()?.get(key)?;
        match PageResponse::decode(&bytes) {
            Ok(page) => Some(page),
            Err(e) => {
                log::debug!("{label}: ignoring unusable cache entry: {e}");
                None
            }
        }
    }

    pub fn fetch(&self, request: &FetchRequest) -> FetchResult {
        let label = request.label();
        let key = request.cache_key();
        if let Some(page) = self.cached(&key, &label) {
            log::trace!("{label}: cache hit");
            return FetchResult::cached(page);
        }

        let exec = self
            .retry
            .execute(&label, &self.limiter, || self.fetcher.fetch(request));

        if let (Some(cache), Some(body)) = (&self.cache, &exec.body) {
            if let Err(e) = cache.put(&key, body) {
                log::warn!("{label}: cache write failed: {e}");
            }
        }
        if let Some(log) = &self.log {
            let (url, params) = self.fetcher.describe(request);
            log.append(LogRecord::new(request, url, params, &exec.result));
        }
        exec.result
    }
}

impl std::fmt::Debug for PageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageClient")
            .field("limiter", &self.limiter)
            .field("cache", &self.cache.is_some())
            .field("log", &self.log.is_some())
            .finish_non_exhaustive()
    }
}
