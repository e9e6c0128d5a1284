//! Upstream wire edge.
//!
//! BrAPI responses share one envelope: `metadata.pagination` describing the
//! page and `result` holding either `{data: [...]}` or a single object.
//! The trait keeps the HTTP edge mockable; the fetcher never sees reqwest.

use async_trait::async_trait;
use brapi_protocol::{Page, Pagination, QueryDescriptor, Record};
use serde::Deserialize;
use std::time::Duration;

use crate::error::TransportError;

/// Bounded per-call timeout for page requests (the original client used 60 s).
pub const PAGE_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of `POST search/{endpoint}`: some servers answer inline, others
/// hand back a results id to page through.
#[derive(Debug)]
pub enum SearchSubmission {
    Inline(Page),
    Deferred { results_db_id: String },
}

#[async_trait]
pub trait PageTransport: Send + Sync {
    async fn fetch_page(
        &self,
        query: &QueryDescriptor,
        page: u32,
        page_size: u32,
        bearer: &str,
    ) -> Result<Page, TransportError>;

    async fn submit_search(
        &self,
        query: &QueryDescriptor,
        bearer: &str,
    ) -> Result<SearchSubmission, TransportError>;
}

pub struct HttpPageTransport {
    http: reqwest::Client,
    base_url: String,
}

impl HttpPageTransport {
    /// `base_url` is the API root, e.g. `https://sweetpotatobase.org/brapi/v2`.
    pub fn new(base_url: &str) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(PAGE_REQUEST_TIMEOUT)
            .build()
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn read_body(response: reqwest::Response) -> Result<WireResponse, TransportError> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TransportError::Unauthorized);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                message: truncate_message(&message),
            });
        }
        response
            .json()
            .await
            .map_err(|err| TransportError::Malformed(err.to_string()))
    }
}

fn map_reqwest(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Connect(err.to_string())
    }
}

fn truncate_message(message: &str) -> String {
    const MAX: usize = 200;
    if message.chars().count() > MAX {
        let head: String = message.chars().take(MAX).collect();
        format!("{head}...")
    } else {
        message.to_string()
    }
}

#[async_trait]
impl PageTransport for HttpPageTransport {
    async fn fetch_page(
        &self,
        query: &QueryDescriptor,
        page: u32,
        page_size: u32,
        bearer: &str,
    ) -> Result<Page, TransportError> {
        let mut request = self
            .http
            .get(self.url(&query.path()))
            .bearer_auth(bearer)
            .query(&[("page", page.to_string()), ("pageSize", page_size.to_string())]);
        for (name, values) in &query.params {
            for value in values {
                request = request.query(&[(name.as_str(), value.as_str())]);
            }
        }

        log::debug!("GET {} page={page} pageSize={page_size}", query.path());
        let response = request.send().await.map_err(map_reqwest)?;
        let body = Self::read_body(response).await?;
        Ok(body.into_page(page, page_size))
    }

    async fn submit_search(
        &self,
        query: &QueryDescriptor,
        bearer: &str,
    ) -> Result<SearchSubmission, TransportError> {
        // Search filters post as {name: [values...]}, matching the BrAPI
        // search body shape.
        let body: serde_json::Map<String, serde_json::Value> = query
            .params
            .iter()
            .map(|(name, values)| {
                (
                    name.clone(),
                    serde_json::Value::Array(
                        values
                            .iter()
                            .map(|v| serde_json::Value::String(v.clone()))
                            .collect(),
                    ),
                )
            })
            .collect();

        log::debug!("POST search/{}", query.endpoint);
        let response = self
            .http
            .post(self.url(&format!("search/{}", query.endpoint)))
            .bearer_auth(bearer)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest)?;
        let body = Self::read_body(response).await?;

        if let Some(id) = body.search_results_db_id() {
            return Ok(SearchSubmission::Deferred { results_db_id: id });
        }
        Ok(SearchSubmission::Inline(body.into_page(0, 0)))
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    metadata: Option<WireMetadata>,
    result: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireMetadata {
    pagination: Option<WirePagination>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePagination {
    current_page: Option<u32>,
    page_size: Option<u32>,
    total_count: Option<u64>,
    total_pages: Option<u32>,
}

impl WireResponse {
    fn search_results_db_id(&self) -> Option<String> {
        self.result
            .as_ref()?
            .get("searchResultsDbId")?
            .as_str()
            .map(str::to_string)
    }

    fn into_page(self, requested_page: u32, requested_size: u32) -> Page {
        let pagination = self
            .metadata
            .and_then(|m| m.pagination)
            .map(|p| Pagination {
                current_page: p.current_page.unwrap_or(requested_page),
                page_size: p.page_size.unwrap_or(requested_size),
                total_count: p.total_count,
                total_pages: p.total_pages,
            })
            .unwrap_or(Pagination {
                current_page: requested_page,
                page_size: requested_size,
                total_count: None,
                total_pages: None,
            });

        Page {
            records: self.result.map(extract_records).unwrap_or_default(),
            pagination,
        }
    }
}

/// Pull the record list out of a BrAPI `result` object: `{data: [...]}`
/// for collections, a bare object for single-id lookups, occasionally a
/// bare array.
fn extract_records(result: serde_json::Value) -> Vec<Record> {
    match result {
        serde_json::Value::Object(mut map) => match map.remove("data") {
            Some(serde_json::Value::Array(items)) => {
                items.into_iter().filter_map(into_record).collect()
            }
            _ => into_record(serde_json::Value::Object(map)).into_iter().collect(),
        },
        serde_json::Value::Array(items) => items.into_iter().filter_map(into_record).collect(),
        _ => Vec::new(),
    }
}

fn into_record(value: serde_json::Value) -> Option<Record> {
    match value {
        serde_json::Value::Object(map) => Some(map.into_iter().collect()),
        _ => None,
    }
}
