//! Bounded retry with exponential backoff around a single-call fetcher

use std::time::{Duration, Instant};

use crate::error::{FailureKind, FetchError, SweepError};
use crate::fetcher::{classify, Classified, RawReply};
use crate::limiter::AdaptiveRateLimiter;
use crate::request::FetchResult;

/// Extra wait added on top of a server Retry-After hint
const RETRY_AFTER_JITTER_MS: (u64, u64) = (100, 500);

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts per page, including the first
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            jitter_min: Duration::from_millis(200),
            jitter_max: Duration::from_millis(800),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), SweepError> {
        if self.max_retries == 0 {
            return Err(SweepError::config("max_retries must be >= 1"));
        }
        if self.jitter_min > self.jitter_max {
            return Err(SweepError::config("jitter_min exceeds jitter_max"));
        }
        Ok(())
    }
}

/// Uniform random duration in `[lo, hi]`
fn jitter(lo: Duration, hi: Duration) -> Duration {
    let lo_ms = lo.as_millis() as u64;
    let hi_ms = hi.as_millis().max(lo.as_millis()) as u64;
    Duration::from_millis(fastrand::u64(lo_ms..=hi_ms))
}

/// Server-requested wait, bounded by the limiter's `max_pause`, plus a little jitter.
fn retry_after_wait(hint: Duration, max_pause: Duration) -> Duration {
    let (lo, hi) = RETRY_AFTER_JITTER_MS;
    hint.min(max_pause)
        .saturating_add(jitter(Duration::from_millis(lo), Duration::from_millis(hi)))
}

/// Terminal outcome of one `execute` call, plus the raw body on success (for the cache).
#[derive(Debug)]
pub struct Execution {
    pub result: FetchResult,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Exponential backoff: `base × 2^attempt + jitter`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .base_backoff
            .saturating_mul(2u32.saturating_pow(attempt));
        let wait = exp.saturating_add(jitter(self.config.jitter_min, self.config.jitter_max));
        wait.min(self.config.max_backoff)
    }

    /// Run `attempt_fn` until it yields a valid page, a non-retryable failure,
    /// or `max_retries` attempts have been made. Every attempt takes a limiter
    /// token first. Operational failures come back as a `Failure` result.
    pub fn execute(
        &self,
        label: &str,
        limiter: &AdaptiveRateLimiter,
        mut attempt_fn: impl FnMut() -> Result<RawReply, FetchError>,
    ) -> Execution {
        let max = self.config.max_retries;
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            limiter.acquire();
            attempt += 1;

            let (kind, message, status, wait) = match attempt_fn() {
                Ok(reply) => match classify(&reply) {
                    Classified::Page(page) => {
                        limiter.on_success();
                        let result =
                            FetchResult::success(page, reply.status, started.elapsed(), attempt);
                        return Execution {
                            result,
                            body: Some(reply.body),
                        };
                    }
                    Classified::Throttled { retry_after } => {
                        limiter.on_throttled(retry_after);
                        let wait = match retry_after {
                            Some(hint) => retry_after_wait(hint, limiter.config().max_pause),
                            None => self.backoff(attempt),
                        };
                        (
                            FailureKind::Throttled,
                            format!("HTTP {}", reply.status),
                            Some(reply.status),
                            wait,
                        )
                    }
                    Classified::Failed { kind, message } => {
                        (kind, message, Some(reply.status), self.backoff(attempt))
                    }
                },
                Err(e) => (e.kind(), e.to_string(), None, self.backoff(attempt)),
            };

            if !kind.is_retryable() {
                log::warn!("{label}: {kind}: {message}");
                return Execution {
                    result: FetchResult::failure(kind, message, status, started.elapsed(), attempt),
                    body: None,
                };
            }
            if attempt >= max {
                log::warn!("{label}: giving up after {attempt} attempts: {kind}: {message}");
                return Execution {
                    result: FetchResult::failure(kind, message, status, started.elapsed(), attempt),
                    body: None,
                };
            }

            log::debug!(
                "{label}: attempt {attempt}/{max} failed ({kind}: {message}), retrying in {:.1}s",
                wait.as_secs_f64()
            );
            std::thread::sleep(wait);
        }
    }
}
