//! End-to-end sweeps against a scripted in-process fetcher

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pagesweep_core::{
    DirCache, Engine, EngineConfig, FailureKind, FetchError, FetchRequest, FieldFilter,
    LogSink, MemoryCache, PageFetcher, PartitionOutcome, PartitionState, RateLimitConfig,
    RawReply, RetryConfig, RunReport,
};

/// Serves `total_items` per partition key, `page_size` items per page.
#[derive(Default)]
struct Scripted {
    totals: HashMap<String, u64>,
    delay: Duration,
    /// (key, page) that always answer 503
    broken: HashSet<(String, u32)>,
    /// keys whose fetch panics
    panics: HashSet<String>,
    calls: Mutex<Vec<(String, u32)>>,
}

impl Scripted {
    fn new(totals: &[(&str, u64)]) -> Self {
        Self {
            totals: totals.iter().map(|(k, n)| (k.to_string(), *n)).collect(),
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn calls_for(&self, key: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(k, _)| k == key).count()
    }
}

impl PageFetcher for Scripted {
    fn fetch(&self, r: &FetchRequest) -> Result<RawReply, FetchError> {
        self.calls
            .lock()
            .unwrap()
            .push((r.partition_key.clone(), r.page));
        if self.panics.contains(&r.partition_key) {
            panic!("fetcher blew up on {}", r.partition_key);
        }
        std::thread::sleep(self.delay);
        if self.broken.contains(&(r.partition_key.clone(), r.page)) {
            return Ok(RawReply {
                status: 503,
                retry_after: None,
                body: b"Service Unavailable".to_vec(),
            });
        }
        let total = self.totals.get(&r.partition_key).copied().unwrap_or(0);
        let first = u64::from(r.page - 1) * u64::from(r.page_size);
        let n = total.saturating_sub(first).min(u64::from(r.page_size));
        let items: Vec<serde_json::Value> = (0..n)
            .map(|i| {
                serde_json::json!({
                    "key": r.partition_key,
                    "page": r.page,
                    "n": first + i,
                    "parity": (first + i) % 2,
                })
            })
            .collect();
        let body = serde_json::json!({"status": "success", "count": total, "items": items});
        Ok(RawReply {
            status: 200,
            retry_after: None,
            body: serde_json::to_vec(&body).unwrap(),
        })
    }

    fn describe(&self, r: &FetchRequest) -> (String, BTreeMap<String, String>) {
        (format!("scripted://{}", r.partition_key), BTreeMap::new())
    }
}

#[derive(Clone, Default)]
struct Lines(Arc<Mutex<Vec<String>>>);

impl LogSink for Lines {
    fn write_lines(&mut self, lines: &[String]) -> io::Result<()> {
        self.0.lock().unwrap().extend_from_slice(lines);
        Ok(())
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        page_size: 100,
        rate: RateLimitConfig {
            initial_rate: 10_000.0,
            min_rate: 1.0,
            max_rate: 10_000.0,
            ..Default::default()
        },
        retry: RetryConfig {
            max_retries: 2,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            jitter_min: Duration::ZERO,
            jitter_max: Duration::from_millis(1),
        },
        ..Default::default()
    }
}

fn keys(ks: &[&str]) -> Vec<String> {
    ks.iter().map(|k| k.to_string()).collect()
}

fn outcome<'a>(report: &'a RunReport, key: &str) -> &'a PartitionOutcome {
    report
        .reports
        .iter()
        .find(|r| r.partition_key == key)
        .and_then(|r| r.result.as_ref().ok())
        .unwrap_or_else(|| panic!("no outcome for {key}"))
}

#[test]
fn sweep_collects_every_item() {
    let fetcher = Arc::new(Scripted::new(&[("TJAM", 350), ("TJRJ", 500), ("TJSP", 0)]));
    let engine = Engine::new(fast_config(), fetcher.clone()).unwrap();

    let mut streamed = Vec::new();
    let report = engine
        .run(keys(&["TJAM", "TJRJ", "TJSP"]), |r| {
            streamed.push(r.partition_key.clone())
        })
        .unwrap();

    assert!(report.all_completed());
    assert_eq!(streamed.len(), 3);

    let tjam = outcome(&report, "TJAM");
    assert_eq!(tjam.total_pages, 4);
    assert_eq!(tjam.pages_completed, 4);
    assert_eq!(tjam.results.len(), 350);
    let mut ns: Vec<u64> = tjam.results.iter().map(|v| v["n"].as_u64().unwrap()).collect();
    ns.sort_unstable();
    assert_eq!(ns, (0..350).collect::<Vec<_>>());

    let tjrj = outcome(&report, "TJRJ");
    assert_eq!(tjrj.total_pages, 5);
    assert_eq!(tjrj.results.len(), 500);

    assert_eq!(report.items_kept(), 850);
    assert_eq!(fetcher.calls(), 4 + 5 + 1);
}

#[test]
fn items_within_a_page_keep_server_order() {
    let fetcher = Arc::new(Scripted::new(&[("TJAM", 250)]));
    let engine = Engine::new(fast_config(), fetcher).unwrap();
    let report = engine.run(keys(&["TJAM"]), |_| {}).unwrap();

    let results = &outcome(&report, "TJAM").results;
    for page in results.chunk_by(|a, b| a["page"] == b["page"]) {
        let ns: Vec<u64> = page.iter().map(|v| v["n"].as_u64().unwrap()).collect();
        assert!(ns.windows(2).all(|w| w[0] < w[1]));
    }
}

#[test]
fn empty_partition_has_no_page_tasks() {
    let fetcher = Arc::new(Scripted::new(&[("TJAC", 0)]));
    let engine = Engine::new(fast_config(), fetcher.clone()).unwrap();

    let started = Instant::now();
    let report = engine.run(keys(&["TJAC"]), |_| {}).unwrap();
    let out = outcome(&report, "TJAC");

    assert_eq!(out.state, PartitionState::Completed);
    assert_eq!(out.total_pages, 0);
    assert_eq!(out.pages_completed, 0);
    assert!(out.results.is_empty());
    assert!(out.errors.is_empty());
    assert_eq!(fetcher.calls(), 1);
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn cached_rerun_makes_no_network_calls() {
    let fetcher = Arc::new(Scripted::new(&[("TJAM", 350)]));
    let engine = Engine::new(fast_config(), fetcher.clone())
        .unwrap()
        .with_cache(Arc::new(MemoryCache::new()));

    engine.run(keys(&["TJAM"]), |_| {}).unwrap();
    let calls = fetcher.calls();
    let acquired = engine.limiter().acquired();

    let report = engine.run(keys(&["TJAM"]), |_| {}).unwrap();
    assert_eq!(outcome(&report, "TJAM").results.len(), 350);
    assert_eq!(fetcher.calls(), calls);
    assert_eq!(engine.limiter().acquired(), acquired);
}

#[test]
fn dir_cache_survives_engine_restart() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(Scripted::new(&[("TJAM", 150)]));

    let first = Engine::new(fast_config(), fetcher.clone())
        .unwrap()
        .with_cache(Arc::new(DirCache::new(dir.path()).unwrap()));
    first.run(keys(&["TJAM"]), |_| {}).unwrap();
    assert_eq!(fetcher.calls(), 2);

    let second = Engine::new(fast_config(), fetcher.clone())
        .unwrap()
        .with_cache(Arc::new(DirCache::new(dir.path()).unwrap()));
    let report = second.run(keys(&["TJAM"]), |_| {}).unwrap();
    assert_eq!(outcome(&report, "TJAM").results.len(), 150);
    assert_eq!(fetcher.calls(), 2);
}

#[test]
fn failing_page_is_recorded_and_others_kept() {
    let mut scripted = Scripted::new(&[("TJAM", 350)]);
    scripted.broken.insert(("TJAM".to_string(), 3));
    let fetcher = Arc::new(scripted);
    let engine = Engine::new(fast_config(), fetcher.clone()).unwrap();

    let report = engine.run(keys(&["TJAM"]), |_| {}).unwrap();
    let out = outcome(&report, "TJAM");

    assert_eq!(out.state, PartitionState::Completed);
    assert_eq!(out.pages_completed, 3);
    assert_eq!(out.pages_failed, 1);
    assert_eq!(out.results.len(), 250);
    assert_eq!(out.errors.len(), 1);
    assert_eq!(out.errors[0].page, 3);
    assert_eq!(out.errors[0].kind, FailureKind::TransientServerError);
    // page 3 used every attempt, the rest one each
    assert_eq!(fetcher.calls_for("TJAM"), 3 + 2);
}

#[test]
fn discovery_failure_marks_partition_failed() {
    let mut scripted = Scripted::new(&[("TJAM", 350), ("TJRJ", 100)]);
    scripted.broken.insert(("TJAM".to_string(), 1));
    let engine = Engine::new(fast_config(), Arc::new(scripted)).unwrap();

    let report = engine.run(keys(&["TJAM", "TJRJ"]), |_| {}).unwrap();
    let failed = outcome(&report, "TJAM");
    assert_eq!(failed.state, PartitionState::Failed);
    assert_eq!(failed.pages_failed, 0);
    assert_eq!(failed.errors.len(), 1);
    assert_eq!(failed.errors[0].kind, FailureKind::TransientServerError);

    assert_eq!(outcome(&report, "TJRJ").state, PartitionState::Completed);
    assert!(!report.all_completed());
}

#[test]
fn absurd_item_count_fails_partition_without_fetching() {
    let fetcher = Arc::new(Scripted::new(&[("TJAM", u64::MAX), ("TJRJ", 250)]));
    let config = EngineConfig {
        max_pages: 1_000,
        ..fast_config()
    };
    let engine = Engine::new(config, fetcher.clone()).unwrap();

    let report = engine.run(keys(&["TJAM", "TJRJ"]), |_| {}).unwrap();
    let huge = outcome(&report, "TJAM");
    assert_eq!(huge.state, PartitionState::Failed);
    assert_eq!(huge.errors.len(), 1);
    assert_eq!(huge.errors[0].kind, FailureKind::InvalidResponseSchema);
    assert!(huge.errors[0].message.contains("page limit"));
    assert_eq!(fetcher.calls_for("TJAM"), 1);

    assert_eq!(outcome(&report, "TJRJ").results.len(), 250);
}

#[test]
fn partition_deadline_returns_partial_results() {
    let mut scripted = Scripted::new(&[("TJSP", 1000)]);
    scripted.delay = Duration::from_millis(150);
    let config = EngineConfig {
        page_workers: 1,
        partition_timeout: Duration::from_millis(500),
        ..fast_config()
    };
    let engine = Engine::new(config, Arc::new(scripted)).unwrap();

    let started = Instant::now();
    let report = engine.run(keys(&["TJSP"]), |_| {}).unwrap();
    assert!(started.elapsed() < Duration::from_millis(900));

    let out = outcome(&report, "TJSP");
    assert_eq!(out.state, PartitionState::TimedOut);
    assert_eq!(out.total_pages, 10);
    assert!(out.pages_completed >= 2);
    assert_eq!(out.pages_completed + out.pages_failed, out.total_pages);
    assert_eq!(out.results.len() as u32, out.pages_completed * 100);
    assert!(out.errors.iter().all(|e| e.kind == FailureKind::Timeout));
}

#[test]
fn crashed_partition_does_not_affect_others() {
    let mut scripted = Scripted::new(&[("TJAM", 100), ("TJRJ", 100)]);
    scripted.panics.insert("BOOM".to_string());
    let engine = Engine::new(fast_config(), Arc::new(scripted)).unwrap();

    let report = engine.run(keys(&["TJAM", "BOOM", "TJRJ"]), |_| {}).unwrap();
    assert_eq!(report.reports.len(), 3);
    assert!(report.incomplete.is_empty());

    let boom = report
        .reports
        .iter()
        .find(|r| r.partition_key == "BOOM")
        .unwrap();
    let message = boom.result.as_ref().unwrap_err();
    assert!(message.contains("blew up"));
    assert_eq!(outcome(&report, "TJAM").results.len(), 100);
    assert_eq!(outcome(&report, "TJRJ").results.len(), 100);
}

#[test]
fn partition_concurrency_scales_wall_time() {
    let mut scripted = Scripted::new(&[]);
    scripted.delay = Duration::from_millis(100);
    let scripted = Arc::new(scripted);
    let config = EngineConfig {
        partition_workers: 3,
        ..fast_config()
    };
    let engine = Engine::new(config, scripted).unwrap();

    // six one-call partitions, three at a time: two rounds
    let started = Instant::now();
    let report = engine
        .run(keys(&["A", "B", "C", "D", "E", "F"]), |_| {})
        .unwrap();
    let elapsed = started.elapsed();
    assert_eq!(report.reports.len(), 6);
    assert!(elapsed >= Duration::from_millis(190), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(550), "{elapsed:?}");
}

#[test]
fn run_timeout_reports_incomplete_partitions() {
    let mut scripted = Scripted::new(&[("SLOW", 1000)]);
    scripted.delay = Duration::from_millis(100);
    let config = EngineConfig {
        partition_workers: 1,
        page_workers: 1,
        run_timeout: Some(Duration::from_millis(250)),
        ..fast_config()
    };
    let engine = Engine::new(config, Arc::new(scripted)).unwrap();

    let started = Instant::now();
    let report = engine.run(keys(&["SLOW", "NEXT"]), |_| {}).unwrap();
    assert!(started.elapsed() < Duration::from_millis(600));
    assert!(report.reports.is_empty());
    assert_eq!(report.incomplete, keys(&["SLOW", "NEXT"]));
    assert!(!report.all_completed());
}

#[test]
fn item_filter_applies_to_every_page() {
    let fetcher = Arc::new(Scripted::new(&[("TJAM", 350)]));
    let filter = FieldFilter::new(BTreeMap::from([("parity".to_string(), "0".to_string())]));
    let engine = Engine::new(fast_config(), fetcher)
        .unwrap()
        .with_item_filter(filter.into_item_filter());

    let report = engine.run(keys(&["TJAM"]), |_| {}).unwrap();
    let out = outcome(&report, "TJAM");
    assert_eq!(out.results.len(), 175);
    assert!(out.results.iter().all(|v| v["parity"] == 0));
}

#[test]
fn request_log_has_one_record_per_fetch() {
    let lines = Lines::default();
    let fetcher = Arc::new(Scripted::new(&[("TJAM", 350), ("TJRJ", 500)]));
    let engine = Engine::new(fast_config(), fetcher)
        .unwrap()
        .with_request_log(lines.clone());

    engine.run(keys(&["TJAM", "TJRJ"]), |_| {}).unwrap();

    let lines = lines.0.lock().unwrap();
    assert_eq!(lines.len(), 9);
    let record: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(record["outcome"], "success");
    assert!(record["url"].as_str().unwrap().starts_with("scripted://"));
    assert_eq!(engine.request_log().unwrap().pending(), 0);
}

#[test]
fn request_log_flushes_in_batches() {
    let lines = Lines::default();
    let fetcher = Arc::new(Scripted::new(&[("TJAM", 350)]));
    let config = EngineConfig {
        log_batch_size: 2,
        page_workers: 1,
        ..fast_config()
    };
    let engine = Engine::new(config, fetcher)
        .unwrap()
        .with_request_log(lines.clone());

    engine.run(keys(&["TJAM"]), |_| {}).unwrap();
    let log = engine.request_log().unwrap();
    // four records: two automatic batches, nothing left for the final flush
    assert_eq!(log.flushes(), 2);
    assert_eq!(lines.0.lock().unwrap().len(), 4);
}

#[test]
fn invalid_config_fails_fast() {
    let config = EngineConfig {
        page_size: 0,
        ..fast_config()
    };
    assert!(Engine::new(config, Arc::new(Scripted::new(&[]))).is_err());
}
