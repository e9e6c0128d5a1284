use brapi_auth::AuthError;
use brapi_protocol::Record;
use thiserror::Error;

/// One failed page-level exchange with the upstream.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Request timed out")]
    Timeout,

    /// The server invalidated the presented token (401).
    #[error("Unauthorized")]
    Unauthorized,

    /// Any other non-2xx status.
    #[error("Upstream returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Undecodable upstream response: {0}")]
    Malformed(String),
}

impl TransportError {
    /// Transient conditions are retried with backoff; everything else is
    /// surfaced on first occurrence.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Connect(_) | TransportError::Timeout => true,
            TransportError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Pages accumulated before a fatal condition. Never silently dropped:
/// errors carry them so callers can distinguish "nothing" from "cut short".
#[derive(Debug, Default)]
pub struct PartialFetch {
    pub records: Vec<Record>,
    pub pages_fetched: u32,
}

#[derive(Error, Debug)]
pub enum FetchError {
    /// Transient failure that survived the retry budget.
    #[error("Network error after retries: {message} ({} records accumulated)", partial.records.len())]
    Network {
        message: String,
        partial: PartialFetch,
    },

    /// 4xx other than 401: the request itself is wrong, no retry.
    #[error("Upstream rejected the request ({status}): {message} ({} records accumulated)", partial.records.len())]
    UpstreamRejected {
        status: u16,
        message: String,
        partial: PartialFetch,
    },

    /// A page request got 401 and the refreshed token was rejected too.
    #[error("Upstream rejected the refreshed token ({} records accumulated)", partial.records.len())]
    TokenRejected { partial: PartialFetch },

    /// Login/refresh failure before or during the fetch.
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Malformed upstream response: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, FetchError>;
