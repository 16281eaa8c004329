//! Page-count discovery from the first page of a partition

use crate::client::PageClient;
use crate::error::SweepError;
use crate::request::{FetchRequest, FetchResult};

/// Default bound on pages per partition
pub const DEFAULT_MAX_PAGES: u32 = 100_000;

/// `ceil(total_items / page_size)`; zero items means zero pages.
pub fn total_pages(total_items: u64, page_size: u32) -> Result<u32, SweepError> {
    if page_size == 0 {
        return Err(SweepError::config("page_size must be > 0"));
    }
    let pages = total_items.div_ceil(u64::from(page_size));
    Ok(u32::try_from(pages).unwrap_or(u32::MAX))
}

/// Page 1 plus the partition size it reported.
#[derive(Debug)]
pub struct Discovery {
    pub total_items: u64,
    pub total_pages: u32,
    pub first_page: FetchResult,
}

#[derive(Debug)]
pub enum DiscoveryError {
    InvalidConfiguration(String),
    /// Page 1 ended in a terminal failure
    Fetch(Box<FetchResult>),
    /// The reported item count implies more pages than `limit`
    TooManyPages {
        total_items: u64,
        total_pages: u32,
        limit: u32,
    },
}

impl std::fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidConfiguration(msg) => write!(f, "invalid configuration: {msg}"),
            Self::Fetch(result) => match (result.failure_kind(), &result.error) {
                (Some(kind), Some(msg)) => write!(f, "page 1 failed ({kind}): {msg}"),
                (Some(kind), None) => write!(f, "page 1 failed ({kind})"),
                _ => f.write_str("page 1 failed"),
            },
            Self::TooManyPages {
                total_items,
                total_pages,
                limit,
            } => write!(
                f,
                "server reports {total_items} items ({total_pages} pages), above the {limit} page limit"
            ),
        }
    }
}

impl std::error::Error for DiscoveryError {}

/// Fetch page 1 of `template`'s partition through the full client stack and
/// derive the total page count from its reported item count. More than
/// `max_pages` pages is refused.
pub fn discover(
    client: &PageClient,
    template: &FetchRequest,
    max_pages: u32,
) -> Result<Discovery, DiscoveryError> {
    if template.page_size == 0 {
        return Err(DiscoveryError::InvalidConfiguration(
            "page_size must be > 0".to_string(),
        ));
    }
    let first_page = client.fetch(&template.for_page(1));
    let Some(total_items) = first_page.total_available() else {
        return Err(DiscoveryError::Fetch(Box::new(first_page)));
    };
    let total_pages = total_pages(total_items, template.page_size)
        .map_err(|e| DiscoveryError::InvalidConfiguration(e.to_string()))?;
    if total_pages > max_pages {
        return Err(DiscoveryError::TooManyPages {
            total_items,
            total_pages,
            limit: max_pages,
        });
    }
    log::debug!(
        "{}: {total_items} items, {total_pages} pages of {}",
        template.partition_key,
        template.page_size
    );
    Ok(Discovery {
        total_items,
        total_pages,
        first_page,
    })
}
