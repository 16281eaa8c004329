//! Adaptive token-bucket rate limiter shared by every worker.
//!
//! Throughput shrinks geometrically on throttle events and creeps back up
//! additively once the server has been quiet for a recovery window.
//! Waiting callers are not served in FIFO order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::SweepError;

/// Shortest sleep between token checks
const MIN_WAIT: Duration = Duration::from_millis(10);

/// Lowest accepted `min_rate`: one request every ~17 minutes
pub const RATE_FLOOR: f64 = 0.001;

/// Time until `missing` tokens accrue at `rate`, never longer than `cap`.
fn token_wait(missing: f64, rate: f64, cap: Duration) -> Duration {
    Duration::try_from_secs_f64(missing / rate)
        .unwrap_or(cap)
        .min(cap)
}

/// Rate bounds and adaptation knobs (rates in requests per second).
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub initial_rate: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    /// Added to the rate on a success after the recovery window
    pub increment: f64,
    /// Per-throttle multiplier, raised to the consecutive throttle count
    pub decay: f64,
    pub recovery_window: Duration,
    /// Upper bound on a Retry-After pause applied to all callers
    pub max_pause: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            initial_rate: 3.0,
            min_rate: 1.0,
            max_rate: 3.0,
            increment: 0.5,
            decay: 0.6,
            recovery_window: Duration::from_secs(30),
            max_pause: Duration::from_secs(120),
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), SweepError> {
        let finite = [
            self.initial_rate,
            self.min_rate,
            self.max_rate,
            self.increment,
            self.decay,
        ]
        .iter()
        .all(|v| v.is_finite());
        if !finite {
            return Err(SweepError::config("rate limits must be finite numbers"));
        }
        if self.min_rate < RATE_FLOOR {
            return Err(SweepError::config(format!(
                "min_rate must be >= {RATE_FLOOR} req/s"
            )));
        }
        if self.min_rate > self.max_rate {
            return Err(SweepError::config(format!(
                "min_rate ({}) exceeds max_rate ({})",
                self.min_rate, self.max_rate
            )));
        }
        if !(self.decay > 0.0 && self.decay < 1.0) {
            return Err(SweepError::config("decay must be in (0, 1)"));
        }
        if self.increment < 0.0 {
            return Err(SweepError::config("increment must be >= 0"));
        }
        Ok(())
    }
}

/// Point-in-time copy of the limiter state.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterState {
    pub current_rate: f64,
    pub capacity: f64,
    pub tokens: f64,
    pub consecutive_throttles: u32,
    pub last_throttle: Option<Instant>,
}

struct Bucket {
    state: RateLimiterState,
    last_refill: Instant,
    paused_until: Option<Instant>,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let s = &mut self.state;
        s.tokens = (s.tokens + elapsed * s.current_rate).min(s.capacity);
        self.last_refill = now;
    }

    fn set_rate(&mut self, rate: f64) {
        let s = &mut self.state;
        s.current_rate = rate;
        // a whole token must stay reachable when the rate drops below 1 req/s
        s.capacity = rate.max(1.0);
        s.tokens = s.tokens.min(s.capacity);
    }
}

pub struct AdaptiveRateLimiter {
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
    acquired: AtomicU64,
}

impl AdaptiveRateLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self, SweepError> {
        config.validate()?;
        let rate = config.initial_rate.clamp(config.min_rate, config.max_rate);
        let capacity = rate.max(1.0);
        Ok(Self {
            bucket: Mutex::new(Bucket {
                state: RateLimiterState {
                    current_rate: rate,
                    capacity,
                    tokens: capacity,
                    consecutive_throttles: 0,
                    last_throttle: None,
                },
                last_refill: Instant::now(),
                paused_until: None,
            }),
            acquired: AtomicU64::new(0),
            config,
        })
    }

    // State is plain numbers; a panic elsewhere cannot leave it half-updated.
    fn lock(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until one token is available, then take it.
    pub fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.lock();
                let now = Instant::now();
                match bucket.paused_until {
                    Some(until) if until > now => until - now,
                    _ => {
                        bucket.paused_until = None;
                        bucket.refill(now);
                        if bucket.state.tokens >= 1.0 {
                            bucket.state.tokens -= 1.0;
                            self.acquired.fetch_add(1, Ordering::Relaxed);
                            return;
                        }
                        let missing = 1.0 - bucket.state.tokens;
                        token_wait(missing, bucket.state.current_rate, self.config.max_pause)
                    }
                }
            };
            std::thread::sleep(wait.max(MIN_WAIT));
        }
    }

    /// Server signalled overload: shrink the rate, optionally pause everyone.
    pub fn on_throttled(&self, retry_after: Option<Duration>) {
        let mut bucket = self.lock();
        let now = Instant::now();
        bucket.refill(now);

        bucket.state.consecutive_throttles += 1;
        bucket.state.last_throttle = Some(now);
        let factor = self
            .config
            .decay
            .powi(bucket.state.consecutive_throttles as i32);
        let rate = (bucket.state.current_rate * factor).max(self.config.min_rate);
        bucket.set_rate(rate);

        if let Some(hint) = retry_after {
            let until = now + hint.min(self.config.max_pause);
            bucket.paused_until = Some(bucket.paused_until.map_or(until, |p| p.max(until)));
        }

        log::warn!(
            "throttled: rate now {:.2} req/s (consecutive={})",
            rate,
            bucket.state.consecutive_throttles
        );
    }

    /// Successful call: relax the throttle streak, and recover rate after a quiet window.
    pub fn on_success(&self) {
        let mut bucket = self.lock();
        let now = Instant::now();
        bucket.refill(now);

        let s = &mut bucket.state;
        s.consecutive_throttles = s.consecutive_throttles.saturating_sub(1);
        let quiet = s
            .last_throttle
            .map_or(true, |t| now.duration_since(t) > self.config.recovery_window);
        if quiet {
            let old = s.current_rate;
            let rate = (old + self.config.increment).min(self.config.max_rate);
            if rate > old {
                bucket.set_rate(rate);
                log::info!("rate raised to {rate:.2} req/s");
            }
        }
    }

    pub fn snapshot(&self) -> RateLimiterState {
        self.lock().state
    }

    pub fn current_rate(&self) -> f64 {
        self.lock().state.current_rate
    }

    /// Number of tokens granted so far.
    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

impl std::fmt::Debug for AdaptiveRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.snapshot();
        f.debug_struct("AdaptiveRateLimiter")
            .field("current_rate", &state.current_rate)
            .field("consecutive_throttles", &state.consecutive_throttles)
            .finish_non_exhaustive()
    }
}
