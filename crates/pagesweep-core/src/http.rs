//! HTTP [`PageFetcher`] over reqwest.
//!
//! Uses async reqwest on one shared tokio runtime but presents a blocking
//! interface for the page worker threads.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, RETRY_AFTER};
use reqwest::Url;

use crate::error::{FetchError, SweepError};
use crate::fetcher::{PageFetcher, RawReply};
use crate::request::{FetchRequest, QueryNames};
use crate::semaphore::Semaphore;

/// Shared tokio runtime for HTTP operations.
pub static SHARED_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
});

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub base_url: String,
    pub query_names: QueryNames,
    /// Whole-request timeout, body included
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Connection slots shared by all workers
    pub max_connections: usize,
    pub user_agent: String,
    pub headers: BTreeMap<String, String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            query_names: QueryNames::default(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_connections: 16,
            user_agent: concat!("pagesweep/", env!("CARGO_PKG_VERSION")).to_string(),
            headers: BTreeMap::new(),
        }
    }
}

/// `Retry-After` in seconds (fractions allowed). HTTP-date values are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    if secs > 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, SweepError> {
    let mut map = HeaderMap::new();
    map.insert(ACCEPT, HeaderValue::from_static("application/json"));
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| SweepError::config(format!("header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| SweepError::config(format!("header {name}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

pub struct HttpFetcher {
    client: reqwest::Client,
    url: Url,
    config: HttpConfig,
    slots: Semaphore,
}

impl HttpFetcher {
    pub fn new(config: HttpConfig) -> Result<Self, SweepError> {
        let url = Url::parse(&config.base_url)
            .map_err(|e| SweepError::config(format!("base_url {:?}: {e}", config.base_url)))?;
        if config.max_connections == 0 {
            return Err(SweepError::config("max_connections must be >= 1"));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.max_connections)
            .user_agent(config.user_agent.clone())
            .default_headers(header_map(&config.headers)?)
            .build()
            .map_err(|e| SweepError::config(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            url,
            slots: Semaphore::new(config.max_connections),
            config,
        })
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }
}

impl PageFetcher for HttpFetcher {
    fn fetch(&self, request: &FetchRequest) -> Result<RawReply, FetchError> {
        let query = request.query_pairs(&self.config.query_names);
        let _slot = self.slots.acquire();
        SHARED_RUNTIME.handle().block_on(async {
            let response = self
                .client
                .get(self.url.clone())
                .query(&query)
                .timeout(self.config.request_timeout)
                .send()
                .await
                .map_err(|e| FetchError::from_reqwest(&e))?;

            let status = response.status().as_u16();
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = response
                .bytes()
                .await
                .map_err(|e| FetchError::from_reqwest(&e))?;

            Ok::<_, FetchError>(RawReply {
                status,
                retry_after,
                body: body.to_vec(),
            })
        })
    }

    fn describe(&self, request: &FetchRequest) -> (String, BTreeMap<String, String>) {
        let params = request
            .query_pairs(&self.config.query_names)
            .into_iter()
            .collect();
        (self.url.to_string(), params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_seconds() {
        assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after(" 1.5 "), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn retry_after_rejects_junk() {
        assert_eq!(parse_retry_after("0"), None);
        assert_eq!(parse_retry_after("-3"), None);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
        assert_eq!(parse_retry_after("1e300"), None);
    }

    #[test]
    fn bad_base_url_is_config_error() {
        let err = HttpFetcher::new(HttpConfig {
            base_url: "not a url".into(),
            ..Default::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, SweepError::InvalidConfiguration(_)));
    }

    #[test]
    fn bad_header_is_config_error() {
        let result = HttpFetcher::new(HttpConfig {
            base_url: "http://127.0.0.1:9/".into(),
            headers: BTreeMap::from([("bad header".to_string(), "x".to_string())]),
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn describe_lists_params() {
        let fetcher = HttpFetcher::new(HttpConfig {
            base_url: "https://api.example.org/v1/items".into(),
            ..Default::default()
        })
        .unwrap();
        let request = FetchRequest {
            partition_key: "TJAM".into(),
            page: 3,
            page_size: 100,
            date_range_start: "2025-11-06".into(),
            date_range_end: String::new(),
            extra_filters: BTreeMap::new(),
        };
        let (url, params) = fetcher.describe(&request);
        assert_eq!(url, "https://api.example.org/v1/items");
        assert_eq!(params["page"], "3");
        assert_eq!(params["dateRangeStart"], "2025-11-06");
        assert!(!params.contains_key("dateRangeEnd"));
    }
}
