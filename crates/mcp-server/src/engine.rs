//! One upstream's component graph and the operations the tool layer calls.
//!
//! Everything is an explicit object wired at construction: the session
//! registry, the credential manager and the fetcher are passed by reference
//! into every call path. Two servers against two backends are simply two
//! engines.

use brapi_auth::{AuthError, CredentialManager, HttpTokenEndpoint, TokenEndpoint};
use brapi_client::{
    assemble_result_set, FetchError, HttpPageTransport, PageTransport, PaginatedFetcher,
};
use brapi_protocol::{
    derive_result_id, ErrorEnvelope, QueryDescriptor, ResultSummary, Session,
};
use brapi_store::{LoadedRows, SessionRegistry, StoreError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::ServerConfig;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Handle returned by `fetch_and_cache`: enough for the caller to come back
/// for slices and exports without holding any row data.
#[derive(Debug, serde::Serialize)]
pub struct FetchAndCacheOutcome {
    pub session_id: String,
    pub result_id: String,
    pub summary: ResultSummary,
}

pub struct BrapiEngine {
    registry: SessionRegistry,
    fetcher: PaginatedFetcher,
    server_name: String,
    base_url: String,
    max_results_cap: usize,
    retention: Duration,
}

impl BrapiEngine {
    pub fn new(config: &ServerConfig) -> anyhow::Result<Self> {
        let endpoint: Arc<dyn TokenEndpoint> =
            Arc::new(HttpTokenEndpoint::new(&config.base_url)?);
        let credentials = Arc::new(
            CredentialManager::new(endpoint, &config.username, &config.password)
                .with_token_path(config.token_path()),
        );
        let transport: Arc<dyn PageTransport> = Arc::new(HttpPageTransport::new(&config.base_url)?);
        Self::with_components(
            transport,
            credentials,
            config.data_dir.clone(),
            &config.server_name,
            &config.base_url,
            config.max_results_cap,
            config.retention,
        )
    }

    /// Test seam: same wiring, caller-supplied edges.
    pub fn with_components(
        transport: Arc<dyn PageTransport>,
        credentials: Arc<CredentialManager>,
        data_dir: PathBuf,
        server_name: &str,
        base_url: &str,
        max_results_cap: usize,
        retention: Duration,
    ) -> anyhow::Result<Self> {
        let registry = SessionRegistry::open(&data_dir)?;
        Ok(Self {
            registry,
            fetcher: PaginatedFetcher::new(transport, credentials),
            server_name: server_name.to_string(),
            base_url: base_url.to_string(),
            max_results_cap,
            retention,
        })
    }

    /// Drive a full retrieval and publish the assembled result. Returns a
    /// lightweight handle; row data stays on disk.
    pub async fn fetch_and_cache(
        &self,
        session_id: Option<&str>,
        query: QueryDescriptor,
        max_results: usize,
        page_size: u32,
    ) -> Result<FetchAndCacheOutcome, EngineError> {
        let max_results = max_results.min(self.max_results_cap);
        let session = self.session(session_id)?;
        let store = self.registry.store_for(&session.session_id)?;

        let outcome = self.fetcher.fetch(&query, max_results, page_size).await?;
        log::info!(
            "Fetched {} of {} record(s) from {} in {} page(s)",
            outcome.records.len(),
            outcome.total_matches,
            query.path(),
            outcome.pages_fetched
        );

        let result_id = derive_result_id(&query);
        let set = assemble_result_set(
            &session.session_id,
            &result_id,
            outcome.records,
            outcome.total_matches,
        );
        let summary = store.put(&set)?;

        Ok(FetchAndCacheOutcome {
            session_id: session.session_id,
            result_id,
            summary,
        })
    }

    pub fn summary(&self, session_id: &str, result_id: &str) -> Result<ResultSummary, EngineError> {
        Ok(self.registry.store_for(session_id)?.get_summary(result_id)?)
    }

    pub fn load(
        &self,
        session_id: &str,
        result_id: &str,
        columns: Option<&[String]>,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<LoadedRows, EngineError> {
        Ok(self
            .registry
            .store_for(session_id)?
            .load(result_id, columns, limit, offset)?)
    }

    pub fn export_location(
        &self,
        session_id: &str,
        result_id: &str,
    ) -> Result<PathBuf, EngineError> {
        Ok(self.registry.store_for(session_id)?.export_location(result_id))
    }

    pub fn list_results(&self, session_id: &str) -> Result<Vec<ResultSummary>, EngineError> {
        Ok(self.registry.store_for(session_id)?.list_results()?)
    }

    pub fn delete_result(&self, session_id: &str, result_id: &str) -> Result<bool, EngineError> {
        Ok(self
            .registry
            .store_for(session_id)?
            .delete_result(result_id)?)
    }

    /// Age-sweep every session. Run at startup and on a periodic schedule.
    pub fn evict_expired(&self) -> Result<usize, EngineError> {
        Ok(self.registry.evict_all_expired(self.retention)?)
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.registry.list()
    }

    fn session(&self, session_id: Option<&str>) -> Result<Session, EngineError> {
        Ok(self
            .registry
            .get_or_create(session_id, &self.server_name, &self.base_url)?)
    }
}

/// Structured tool-facing error. The code separates "retry later"
/// (network), "fix your input" (rejection, unknown handles/columns) and
/// "re-authenticate" (credential classes).
pub fn error_envelope(err: &EngineError) -> ErrorEnvelope {
    match err {
        EngineError::Fetch(fetch) => match fetch {
            FetchError::Network { partial, .. } => ErrorEnvelope::new(
                "network_error",
                fetch.to_string(),
            )
            .with_hint(format!(
                "Transient upstream failure; retry later. {} record(s) had been fetched before the failure.",
                partial.records.len()
            )),
            FetchError::UpstreamRejected { partial, .. } => ErrorEnvelope::new(
                "upstream_rejected",
                fetch.to_string(),
            )
            .with_hint(format!(
                "The upstream refused the request; check the service name and parameters. {} record(s) were accumulated before the rejection and have been discarded.",
                partial.records.len()
            )),
            FetchError::TokenRejected { .. } => {
                ErrorEnvelope::new("auth_error", fetch.to_string())
                    .with_hint("The refreshed token was rejected; verify the account is still active.")
            }
            FetchError::Auth(AuthError::InvalidCredentials) => {
                ErrorEnvelope::new("invalid_credentials", fetch.to_string())
                    .with_hint("Fix BRAPI_USERNAME / BRAPI_PASSWORD and retry.")
            }
            FetchError::Auth(auth) => ErrorEnvelope::new("auth_unavailable", auth.to_string())
                .with_hint("The token endpoint is unreachable; retry later."),
            FetchError::Malformed(_) => {
                ErrorEnvelope::new("malformed_response", fetch.to_string())
            }
        },
        EngineError::Store(store) => {
            let code = match store {
                StoreError::DuplicateResult(_) => "duplicate_result",
                StoreError::UnknownSessionOrResult(_) => "unknown_session_or_result",
                StoreError::UnknownColumn(_) => "unknown_column",
                StoreError::Storage(_) | StoreError::Encoding(_) => "storage_error",
            };
            ErrorEnvelope::new(code, store.to_string())
        }
    }
}
