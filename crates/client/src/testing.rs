//! Test support: a scripted in-memory upstream.
//!
//! Models one paginated dataset plus an injectable fault queue, so fetch
//! behavior can be exercised without a network.

use async_trait::async_trait;
use brapi_protocol::{Page, Pagination, QueryDescriptor, Record};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::TransportError;
use crate::transport::{PageTransport, SearchSubmission};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchBehavior {
    /// `POST search/{endpoint}` answers with the whole dataset inline.
    Inline,
    /// `POST search/{endpoint}` hands back a results id to page through.
    Deferred,
}

pub struct FixtureUpstream {
    records: Vec<Record>,
    report_total: bool,
    search_behavior: SearchBehavior,
    faults: Mutex<std::collections::HashMap<usize, TransportError>>,
    requests: AtomicUsize,
    bearers_seen: Mutex<Vec<String>>,
    page_sizes_seen: Mutex<Vec<u32>>,
}

impl FixtureUpstream {
    /// `total` synthetic records named `acc-{i}`.
    pub fn new(total: usize) -> Self {
        let records = (0..total)
            .map(|i| {
                let mut record = Record::new();
                record.insert(
                    "germplasmDbId".to_string(),
                    serde_json::Value::String(format!("g{i}")),
                );
                record.insert(
                    "germplasmName".to_string(),
                    serde_json::Value::String(format!("acc-{i}")),
                );
                record
            })
            .collect();
        Self {
            records,
            report_total: true,
            search_behavior: SearchBehavior::Deferred,
            faults: Mutex::new(std::collections::HashMap::new()),
            requests: AtomicUsize::new(0),
            bearers_seen: Mutex::new(Vec::new()),
            page_sizes_seen: Mutex::new(Vec::new()),
        }
    }

    /// Stop reporting totalCount/totalPages, like upstreams that only
    /// support the empty-page termination signal.
    pub fn without_totals(mut self) -> Self {
        self.report_total = false;
        self
    }

    pub fn with_search_behavior(mut self, behavior: SearchBehavior) -> Self {
        self.search_behavior = behavior;
        self
    }

    /// Fail the n-th request (0-based, counting every transport call).
    /// Unscheduled requests succeed normally.
    pub fn fail_request(&self, n: usize, fault: TransportError) {
        self.faults.lock().expect("faults lock").insert(n, fault);
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn bearers_seen(&self) -> Vec<String> {
        self.bearers_seen.lock().expect("bearers lock").clone()
    }

    pub fn page_sizes_seen(&self) -> Vec<u32> {
        self.page_sizes_seen.lock().expect("page sizes lock").clone()
    }

    /// Registers the request and returns its scheduled fault, if any.
    fn record_request(&self, bearer: &str, page_size: u32) -> Option<TransportError> {
        let index = self.requests.fetch_add(1, Ordering::SeqCst);
        self.bearers_seen
            .lock()
            .expect("bearers lock")
            .push(bearer.to_string());
        self.page_sizes_seen
            .lock()
            .expect("page sizes lock")
            .push(page_size);
        self.faults.lock().expect("faults lock").remove(&index)
    }

    fn page(&self, page: u32, page_size: u32) -> Page {
        let start = (page as usize) * (page_size as usize);
        let end = (start + page_size as usize).min(self.records.len());
        let records = if start >= self.records.len() {
            Vec::new()
        } else {
            self.records[start..end].to_vec()
        };
        let total = self.records.len() as u64;
        let total_pages = ((total + page_size as u64 - 1) / page_size as u64) as u32;
        Page {
            records,
            pagination: Pagination {
                current_page: page,
                page_size,
                total_count: self.report_total.then_some(total),
                total_pages: self.report_total.then_some(total_pages),
            },
        }
    }
}

#[async_trait]
impl PageTransport for FixtureUpstream {
    async fn fetch_page(
        &self,
        _query: &QueryDescriptor,
        page: u32,
        page_size: u32,
        bearer: &str,
    ) -> Result<Page, TransportError> {
        if let Some(fault) = self.record_request(bearer, page_size) {
            return Err(fault);
        }
        Ok(self.page(page, page_size))
    }

    async fn submit_search(
        &self,
        _query: &QueryDescriptor,
        bearer: &str,
    ) -> Result<SearchSubmission, TransportError> {
        if let Some(fault) = self.record_request(bearer, 0) {
            return Err(fault);
        }
        match self.search_behavior {
            SearchBehavior::Inline => {
                let page_size = self.records.len().max(1) as u32;
                Ok(SearchSubmission::Inline(self.page(0, page_size)))
            }
            SearchBehavior::Deferred => Ok(SearchSubmission::Deferred {
                results_db_id: "sr-1".to_string(),
            }),
        }
    }
}

/// Token endpoint that mints `tok-{n}` and counts grants.
pub struct FixtureTokenEndpoint {
    grants: AtomicUsize,
}

impl FixtureTokenEndpoint {
    pub fn new() -> Self {
        Self {
            grants: AtomicUsize::new(0),
        }
    }

    pub fn grant_count(&self) -> usize {
        self.grants.load(Ordering::SeqCst)
    }
}

impl Default for FixtureTokenEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl brapi_auth::TokenEndpoint for FixtureTokenEndpoint {
    async fn request_token(
        &self,
        _username: &str,
        _password: &str,
    ) -> brapi_auth::Result<brapi_auth::TokenGrant> {
        let n = self.grants.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(brapi_auth::TokenGrant {
            access_token: format!("tok-{n}"),
            expires_in: 7_200,
            user_display_name: None,
        })
    }
}
