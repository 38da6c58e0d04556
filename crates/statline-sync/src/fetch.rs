//! Rate-gated page walking over one upstream collection.

use std::sync::Arc;

use statline_storage::{ApiPage, RateGate, UpstreamClient};
use tracing::{info_span, warn, Instrument};

use crate::SyncError;

/// Position of one walk through a paged collection.
#[derive(Debug, Clone)]
pub struct PageCursor {
    path: String,
    includes: &'static [&'static str],
    next: Option<u32>,
    pages: u64,
    truncated: bool,
}

impl PageCursor {
    pub fn new(path: impl Into<String>, includes: &'static [&'static str]) -> Self {
        Self {
            path: path.into(),
            includes,
            next: Some(1),
            pages: 0,
            truncated: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Pages fetched so far.
    pub fn pages(&self) -> u64 {
        self.pages
    }

    /// The walk stopped because the rate gate said no.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn is_done(&self) -> bool {
        self.next.is_none()
    }
}

#[derive(Clone)]
pub struct PaginatedFetcher {
    client: Arc<dyn UpstreamClient>,
    gate: Arc<RateGate>,
}

impl PaginatedFetcher {
    pub fn new(client: Arc<dyn UpstreamClient>, gate: Arc<RateGate>) -> Self {
        Self { client, gate }
    }

    /// Fetch the cursor's next page. `Ok(None)` once the last page has been
    /// seen or the rate gate denies the call.
    pub async fn next_page(&self, cursor: &mut PageCursor) -> Result<Option<ApiPage>, SyncError> {
        let Some(page) = cursor.next else {
            return Ok(None);
        };

        if !self.gate.try_consume() {
            warn!(
                path = %cursor.path,
                page,
                budget = self.gate.budget(),
                "rate gate exhausted; stopping walk with partial results"
            );
            cursor.truncated = true;
            cursor.next = None;
            return Ok(None);
        }

        let fetched = self
            .client
            .fetch_page(&cursor.path, cursor.includes, page)
            .instrument(info_span!("page_fetch", path = %cursor.path, page))
            .await
            .map_err(|source| SyncError::Upstream {
                path: cursor.path.clone(),
                page,
                source,
            })?;

        cursor.pages += 1;
        // Never revisit a page, and never go past the reported last page,
        // even if upstream misreports its position.
        cursor.next = if page >= fetched.total_pages {
            None
        } else {
            fetched.next_page().map(|next| next.max(page + 1))
        };
        Ok(Some(fetched))
    }
}
