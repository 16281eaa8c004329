//! Page requests, decoded responses and per-fetch results

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FailureKind;

/// Query parameter names used when rendering a [`FetchRequest`] as a URL.
///
/// Deserializing requires every name, so presets never mix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryNames {
    pub page: String,
    pub page_size: String,
    pub partition_key: String,
    pub date_range_start: String,
    pub date_range_end: String,
}

impl Default for QueryNames {
    fn default() -> Self {
        Self {
            page: "page".to_string(),
            page_size: "pageSize".to_string(),
            partition_key: "partitionKey".to_string(),
            date_range_start: "dateRangeStart".to_string(),
            date_range_end: "dateRangeEnd".to_string(),
        }
    }
}

/// One page of one partition. Cloned per page from a partition template.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchRequest {
    pub partition_key: String,
    /// 1-based
    pub page: u32,
    pub page_size: u32,
    pub date_range_start: String,
    pub date_range_end: String,
    pub extra_filters: BTreeMap<String, String>,
}

impl FetchRequest {
    /// Same partition and filters, different page.
    pub fn for_page(&self, page: u32) -> Self {
        Self {
            page,
            ..self.clone()
        }
    }

    /// Deterministic cache key: blake3 over every field, length-prefixed.
    ///
    /// `extra_filters` is a sorted map, so the filter signature does not depend
    /// on insertion order.
    pub fn cache_key(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        let mut field = |bytes: &[u8]| {
            hasher.update(&(bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        };
        field(self.partition_key.as_bytes());
        field(self.page.to_le_bytes().as_slice());
        field(self.page_size.to_le_bytes().as_slice());
        field(self.date_range_start.as_bytes());
        field(self.date_range_end.as_bytes());
        for (name, value) in &self.extra_filters {
            field(name.as_bytes());
            field(value.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Query string pairs in wire order. Empty date bounds are omitted.
    pub fn query_pairs(&self, names: &QueryNames) -> Vec<(String, String)> {
        let mut pairs = vec![
            (names.page.clone(), self.page.to_string()),
            (names.page_size.clone(), self.page_size.to_string()),
            (names.partition_key.clone(), self.partition_key.clone()),
        ];
        if !self.date_range_start.is_empty() {
            pairs.push((
                names.date_range_start.clone(),
                self.date_range_start.clone(),
            ));
        }
        if !self.date_range_end.is_empty() {
            pairs.push((names.date_range_end.clone(), self.date_range_end.clone()));
        }
        pairs.extend(
            self.extra_filters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        pairs
    }

    /// Short label for log lines, e.g. `TJAM#12`.
    pub fn label(&self) -> String {
        format!("{}#{}", self.partition_key, self.page)
    }
}

/// Decoded API body: `{status, count, items[]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResponse {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    /// Total items available for the whole partition
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub items: Vec<Value>,
}

impl PageResponse {
    /// Parse a body and require `status == "success"` (case-insensitive).
    pub fn decode(body: &[u8]) -> Result<Self, String> {
        let page: PageResponse =
            serde_json::from_slice(body).map_err(|e| format!("invalid JSON body: {e}"))?;
        if !page.status.eq_ignore_ascii_case("success") {
            return Err(format!(
                "status={}, message={}",
                page.status,
                page.message.as_deref().unwrap_or("")
            ));
        }
        Ok(page)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(FailureKind),
}

/// Terminal result of fetching one page (after cache lookup and retries).
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub outcome: Outcome,
    /// Present only on success
    pub page: Option<PageResponse>,
    pub http_status: Option<u16>,
    pub latency: Duration,
    /// Network attempts made; 0 for a cache hit
    pub attempts: u32,
    pub from_cache: bool,
    pub error: Option<String>,
}

impl FetchResult {
    pub(crate) fn success(page: PageResponse, status: u16, latency: Duration, attempts: u32) -> Self {
        Self {
            outcome: Outcome::Success,
            page: Some(page),
            http_status: Some(status),
            latency,
            attempts,
            from_cache: false,
            error: None,
        }
    }

    pub(crate) fn cached(page: PageResponse) -> Self {
        Self {
            outcome: Outcome::Success,
            page: Some(page),
            http_status: None,
            latency: Duration::ZERO,
            attempts: 0,
            from_cache: true,
            error: None,
        }
    }

    pub(crate) fn failure(
        kind: FailureKind,
        error: String,
        status: Option<u16>,
        latency: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            outcome: Outcome::Failure(kind),
            page: None,
            http_status: status,
            latency,
            attempts,
            from_cache: false,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self.outcome {
            Outcome::Success => None,
            Outcome::Failure(kind) => Some(kind),
        }
    }

    pub fn item_count(&self) -> usize {
        self.page.as_ref().map_or(0, |p| p.items.len())
    }

    pub fn total_available(&self) -> Option<u64> {
        self.page.as_ref().map(|p| p.count)
    }
}
