//! pagesweep core - concurrent sweeps over paginated search APIs
//!
//! Fetches every page of many independent partitions under one adaptive
//! rate limit, with bounded retries, a response cache and batched request
//! telemetry.

pub mod cache;
pub mod client;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod filter;
pub mod http;
pub mod limiter;
pub mod logging;
pub mod pages;
pub mod partition;
pub mod partitions;
pub mod progress;
pub mod request;
pub mod request_log;
pub mod retry;
pub mod semaphore;
pub mod shutdown;
pub mod work_queue;

// Re-exports for convenience
pub use cache::{DirCache, MemoryCache, ResponseCache};
pub use client::PageClient;
pub use discovery::{discover, total_pages, Discovery, DiscoveryError, DEFAULT_MAX_PAGES};
pub use engine::{Engine, EngineConfig};
pub use error::{FailureKind, FetchError, SweepError};
pub use fetcher::{classify, Classified, PageFetcher, RawReply};
pub use filter::{keep_all, FieldFilter, ItemFilter};
pub use http::{HttpConfig, HttpFetcher, SHARED_RUNTIME};
pub use limiter::{AdaptiveRateLimiter, RateLimitConfig, RateLimiterState, RATE_FLOOR};
pub use logging::{init_logging, IndicatifLogger};
pub use pages::{Drain, PageDone, PagePool};
pub use partition::{Orchestrator, PageError, PartitionOutcome, PartitionState, PartitionTask};
pub use partitions::{PartitionPool, PartitionReport, RunReport};
pub use progress::{fmt_num, ProgressContext, SharedProgress};
pub use request::{FetchRequest, FetchResult, Outcome, PageResponse, QueryNames};
pub use request_log::{JsonlSink, LogRecord, LogSink, RequestLog};
pub use retry::{Execution, RetryConfig, RetryPolicy};
pub use shutdown::{is_shutdown_requested, request_shutdown, shutdown_flag};
