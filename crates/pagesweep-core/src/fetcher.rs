//! The single-call seam between the engine and the remote API

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{FailureKind, FetchError};
use crate::request::{FetchRequest, PageResponse};

/// Longest body excerpt kept in an error message
const BODY_SNIPPET_LEN: usize = 200;

/// Status, Retry-After hint and body of one HTTP exchange.
#[derive(Debug, Clone)]
pub struct RawReply {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: Vec<u8>,
}

/// Issues exactly one network call for one page.
///
/// Implementations must not retry, rate-limit or cache; [`crate::PageClient`]
/// layers those on top.
pub trait PageFetcher: Send + Sync {
    fn fetch(&self, request: &FetchRequest) -> Result<RawReply, FetchError>;

    /// URL and query parameters for `request`, as recorded in the request log.
    fn describe(&self, request: &FetchRequest) -> (String, BTreeMap<String, String>);
}

/// What a reply means for the retry loop.
#[derive(Debug)]
pub enum Classified {
    Page(PageResponse),
    Throttled { retry_after: Option<Duration> },
    Failed { kind: FailureKind, message: String },
}

/// Classify a raw reply by HTTP status, then by body for 2xx.
pub fn classify(reply: &RawReply) -> Classified {
    match FailureKind::from_status(reply.status) {
        None => match PageResponse::decode(&reply.body) {
            Ok(page) => Classified::Page(page),
            Err(message) => Classified::Failed {
                kind: FailureKind::InvalidResponseSchema,
                message,
            },
        },
        Some(FailureKind::Throttled) => Classified::Throttled {
            retry_after: reply.retry_after,
        },
        Some(kind) => {
            let text = String::from_utf8_lossy(&reply.body);
            let snippet: String = text.chars().take(BODY_SNIPPET_LEN).collect();
            Classified::Failed {
                kind,
                message: format!("HTTP {}: {}", reply.status, snippet.trim()),
            }
        }
    }
}
