//! Bounded multi-page retrieval against one upstream query.
//!
//! The loop is deliberately sequential: the upstream total is only known
//! incrementally and pages are addressed by offset, so speculative fetches
//! would waste work past the caller's cap. The cap is checked before each
//! page is issued, bounding overshoot to one in-flight request.

use brapi_auth::CredentialManager;
use brapi_protocol::{Page, QueryDescriptor, QueryMethod, Record};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{FetchError, PartialFetch, Result, TransportError};
use crate::transport::{PageTransport, SearchSubmission};

/// BrAPI servers cap pageSize; larger requests are reduced transparently.
pub const UPSTREAM_MAX_PAGE_SIZE: u32 = 1_000;

/// Transient failures (connect, timeout, 5xx) get this many attempts per page.
pub const MAX_PAGE_ATTEMPTS: u32 = 3;

const BACKOFF_BASE: Duration = Duration::from_millis(250);

/// What one `fetch` produced. `records` is bounded by the caller's
/// `max_results`; `total_matches` is the upstream-reported total when known,
/// otherwise the best currently-known count.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub records: Vec<Record>,
    pub total_matches: u64,
    pub truncated: bool,
    pub pages_fetched: u32,
}

pub struct PaginatedFetcher {
    transport: Arc<dyn PageTransport>,
    credentials: Arc<CredentialManager>,
}

impl PaginatedFetcher {
    pub fn new(transport: Arc<dyn PageTransport>, credentials: Arc<CredentialManager>) -> Self {
        Self {
            transport,
            credentials,
        }
    }

    /// Retrieve up to `max_results` records for `query`.
    ///
    /// Stops on the cap, on the upstream-reported end, or on an empty page.
    /// When the upstream never reports a total, the empty page is the sole
    /// termination signal; an upstream that returns a non-empty final page
    /// and then goes silent costs one extra (empty) request. Known
    /// limitation: such a server could also undercount `total_matches`;
    /// the loop does not guess beyond what it has seen.
    pub async fn fetch(
        &self,
        query: &QueryDescriptor,
        max_results: usize,
        page_size: u32,
    ) -> Result<FetchOutcome> {
        let page_size = page_size.clamp(1, UPSTREAM_MAX_PAGE_SIZE);

        let effective = match query.method {
            QueryMethod::Get => query.clone(),
            QueryMethod::Search => match self.submit_search(query).await? {
                SearchSubmission::Inline(page) => {
                    log::debug!("search/{} answered inline", query.endpoint);
                    return Ok(outcome_from_inline(page, max_results));
                }
                SearchSubmission::Deferred { results_db_id } => {
                    QueryDescriptor::get(format!("search/{}", query.endpoint))
                        .with_id(results_db_id)
                }
            },
        };

        if max_results == 0 {
            // Probe one minimal page for the total; the caller asked for no
            // rows but still learns whether anything matched.
            let page = self
                .request_page(&effective, 0, 1, &mut PartialFetch::default())
                .await?;
            let total = known_total(&page).unwrap_or(page.records.len() as u64);
            return Ok(FetchOutcome {
                records: Vec::new(),
                total_matches: total,
                truncated: total > 0,
                pages_fetched: 1,
            });
        }

        let mut partial = PartialFetch::default();
        let mut total_count: Option<u64> = None;
        let mut page_index: u32 = 0;

        loop {
            let page = self
                .request_page(&effective, page_index, page_size, &mut partial)
                .await?;
            partial.pages_fetched += 1;

            if let Some(total) = known_total(&page) {
                total_count = Some(total);
            }

            if page.records.is_empty() {
                break;
            }
            partial.records.extend(page.records);

            if partial.records.len() >= max_results {
                partial.records.truncate(max_results);
                break;
            }
            if let Some(total_pages) = page.pagination.total_pages {
                if page_index + 1 >= total_pages {
                    break;
                }
            }
            page_index += 1;
        }

        let returned = partial.records.len() as u64;
        let total_matches = total_count.unwrap_or(returned).max(returned);
        Ok(FetchOutcome {
            truncated: total_matches > returned,
            total_matches,
            records: partial.records,
            pages_fetched: partial.pages_fetched,
        })
    }

    /// One page request with bounded retry and the 401 recovery path:
    /// a 401 triggers exactly one forced refresh and one retry of this
    /// page; a second 401 is fatal.
    async fn request_page(
        &self,
        query: &QueryDescriptor,
        page: u32,
        page_size: u32,
        partial: &mut PartialFetch,
    ) -> Result<Page> {
        let mut bearer = self.credentials.ensure_valid().await?;
        let mut attempts: u32 = 0;
        let mut refreshed = false;

        loop {
            match self
                .transport
                .fetch_page(query, page, page_size, &bearer)
                .await
            {
                Ok(page) => return Ok(page),
                Err(TransportError::Unauthorized) => {
                    if refreshed {
                        return Err(FetchError::TokenRejected {
                            partial: std::mem::take(partial),
                        });
                    }
                    refreshed = true;
                    log::info!("Page request got 401; refreshing credential once");
                    bearer = self.credentials.force_refresh(&bearer).await?;
                }
                Err(err) if err.is_transient() => {
                    attempts += 1;
                    if attempts >= MAX_PAGE_ATTEMPTS {
                        return Err(FetchError::Network {
                            message: err.to_string(),
                            partial: std::mem::take(partial),
                        });
                    }
                    let delay = BACKOFF_BASE * 2u32.pow(attempts - 1);
                    log::warn!(
                        "Transient page failure (attempt {attempts}/{MAX_PAGE_ATTEMPTS}): {err}; backing off {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(TransportError::Status { status, message }) => {
                    return Err(FetchError::UpstreamRejected {
                        status,
                        message,
                        partial: std::mem::take(partial),
                    });
                }
                Err(TransportError::Malformed(message)) => {
                    return Err(FetchError::Malformed(message));
                }
                // Remaining transport variants are transient and handled above.
                Err(err) => {
                    return Err(FetchError::Network {
                        message: err.to_string(),
                        partial: std::mem::take(partial),
                    });
                }
            }
        }
    }

    async fn submit_search(&self, query: &QueryDescriptor) -> Result<SearchSubmission> {
        let mut bearer = self.credentials.ensure_valid().await?;
        let mut attempts: u32 = 0;
        let mut refreshed = false;

        loop {
            match self.transport.submit_search(query, &bearer).await {
                Ok(submission) => return Ok(submission),
                Err(TransportError::Unauthorized) => {
                    if refreshed {
                        return Err(FetchError::TokenRejected {
                            partial: PartialFetch::default(),
                        });
                    }
                    refreshed = true;
                    bearer = self.credentials.force_refresh(&bearer).await?;
                }
                Err(err) if err.is_transient() => {
                    attempts += 1;
                    if attempts >= MAX_PAGE_ATTEMPTS {
                        return Err(FetchError::Network {
                            message: err.to_string(),
                            partial: PartialFetch::default(),
                        });
                    }
                    tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempts - 1)).await;
                }
                Err(TransportError::Status { status, message }) => {
                    return Err(FetchError::UpstreamRejected {
                        status,
                        message,
                        partial: PartialFetch::default(),
                    });
                }
                Err(TransportError::Malformed(message)) => {
                    return Err(FetchError::Malformed(message));
                }
                Err(err) => {
                    return Err(FetchError::Network {
                        message: err.to_string(),
                        partial: PartialFetch::default(),
                    });
                }
            }
        }
    }
}

fn known_total(page: &Page) -> Option<u64> {
    page.pagination.total_count
}

fn outcome_from_inline(page: Page, max_results: usize) -> FetchOutcome {
    let total_known = known_total(&page);
    let mut records = page.records;
    let full = records.len() as u64;
    records.truncate(max_results);
    let returned = records.len() as u64;
    let total_matches = total_known.unwrap_or(full).max(full);
    FetchOutcome {
        truncated: total_matches > returned,
        total_matches,
        records,
        pages_fetched: 1,
    }
}
