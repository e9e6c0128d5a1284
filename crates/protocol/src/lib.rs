//! Shared data model for the BrAPI MCP workspace.
//!
//! Upstream BrAPI servers are schema-loose: every record is an ordered
//! field -> value mapping and different records from the same endpoint may
//! expose different field sets. This crate defines the neutral shapes the
//! fetcher, assembler and store exchange, plus result-id derivation.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Ordered query parameters, one name to one or more values.
pub type ParamMap = IndexMap<String, Vec<String>>;

/// One upstream record, insertion-ordered.
pub type Record = IndexMap<String, serde_json::Value>;

pub const RESULT_ID_HEX_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMethod {
    /// Keyed lookup: `GET {endpoint}[/{id}[/{sub}]]`.
    Get,
    /// Filtered search: `POST search/{endpoint}` with a parameter body.
    Search,
}

/// Identifies one logical retrieval. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub endpoint: String,
    pub method: QueryMethod,
    pub single_id: Option<String>,
    pub sub_resource: Option<String>,
    pub params: ParamMap,
}

impl QueryDescriptor {
    pub fn get(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: QueryMethod::Get,
            single_id: None,
            sub_resource: None,
            params: ParamMap::new(),
        }
    }

    pub fn search(endpoint: impl Into<String>, params: ParamMap) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: QueryMethod::Search,
            single_id: None,
            sub_resource: None,
            params,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.single_id = Some(id.into());
        self
    }

    pub fn with_sub_resource(mut self, sub: impl Into<String>) -> Self {
        self.sub_resource = Some(sub.into());
        self
    }

    pub fn with_params(mut self, params: ParamMap) -> Self {
        self.params = params;
        self
    }

    /// Path segments joined for the request line: `endpoint[/id[/sub]]`.
    pub fn path(&self) -> String {
        let mut parts = vec![self.endpoint.as_str()];
        if let Some(id) = self.single_id.as_deref() {
            parts.push(id);
        }
        if let Some(sub) = self.sub_resource.as_deref() {
            parts.push(sub);
        }
        parts.join("/")
    }

    /// Deterministic serialization of the query identity, used as the
    /// non-random part of result-id derivation. Parameter order is the
    /// caller's insertion order, so the same constructed query always
    /// produces the same material.
    pub fn cache_key_material(&self) -> String {
        let mut out = String::new();
        out.push_str(self.path().as_str());
        match self.method {
            QueryMethod::Get => out.push_str("|get"),
            QueryMethod::Search => out.push_str("|search"),
        }
        for (name, values) in &self.params {
            out.push('|');
            out.push_str(name);
            out.push('=');
            out.push_str(values.join(",").as_str());
        }
        out
    }
}

/// Upstream-reported pagination metadata for one page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pagination {
    pub current_page: u32,
    pub page_size: u32,
    pub total_count: Option<u64>,
    pub total_pages: Option<u32>,
}

/// One page of records plus its metadata. Transient: consumed by the
/// assembler and discarded.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<Record>,
    pub pagination: Pagination,
}

/// One cached, assembled, immutable table produced by one query.
///
/// Invariants: `columns` is the first-seen union over all rows, every row
/// carries every column (explicit null for absent fields),
/// `returned_count == rows.len()`, and
/// `truncated == (total_matches > returned_count)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSet {
    pub session_id: String,
    pub result_id: String,
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
    pub total_matches: u64,
    pub returned_count: u64,
    pub truncated: bool,
    /// Unix seconds.
    pub created_at: u64,
}

/// Lightweight view of a cached result; never materializes row data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSummary {
    pub result_id: String,
    pub columns: Vec<String>,
    pub column_count: usize,
    pub row_count: u64,
    pub total_matches: u64,
    pub truncated: bool,
    pub approx_size_bytes: u64,
    pub created_at: u64,
}

impl ResultSummary {
    pub fn of(set: &ResultSet, approx_size_bytes: u64) -> Self {
        Self {
            result_id: set.result_id.clone(),
            columns: set.columns.clone(),
            column_count: set.columns.len(),
            row_count: set.returned_count,
            total_matches: set.total_matches,
            truncated: set.truncated,
            approx_size_bytes,
            created_at: set.created_at,
        }
    }
}

/// Grouping scope for cached results tied to one backend connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub name: String,
    pub base_url: String,
    /// Unix seconds.
    pub created_at: u64,
}

/// Structured error surfaced to tool callers. `code` distinguishes
/// retry-later, fix-your-input and re-authenticate classes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    pub hint: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Derive a result id from the query identity plus a short random salt.
///
/// The sha256 prefix keeps ids stable-looking and greppable in logs; the
/// salt keeps repeated identical queries in one session from colliding,
/// since cached results are write-once.
pub fn derive_result_id(query: &QueryDescriptor) -> String {
    let mut salt = [0u8; 4];
    // getrandom only fails on broken platforms; fall back to a time-derived
    // salt rather than poisoning the fetch path.
    if getrandom::getrandom(&mut salt).is_err() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.subsec_nanos());
        salt = nanos.to_be_bytes();
    }
    derive_result_id_salted(query, &salt)
}

fn derive_result_id_salted(query: &QueryDescriptor, salt: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.cache_key_material().as_bytes());
    hasher.update(b"|");
    hasher.update(salt);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(RESULT_ID_HEX_LEN);
    for byte in digest.iter().take(RESULT_ID_HEX_LEN / 2) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Unix seconds now; storage stamps and credential expiry share this base.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params(pairs: &[(&str, &[&str])]) -> ParamMap {
        let mut map = ParamMap::new();
        for (name, values) in pairs {
            map.insert(
                (*name).to_string(),
                values.iter().map(|v| (*v).to_string()).collect(),
            );
        }
        map
    }

    #[test]
    fn path_includes_id_and_sub_resource() {
        let query = QueryDescriptor::get("variantsets")
            .with_id("vs1")
            .with_sub_resource("calls");
        assert_eq!(query.path(), "variantsets/vs1/calls");
    }

    #[test]
    fn cache_key_material_is_order_sensitive() {
        let a = QueryDescriptor::get("studies")
            .with_params(params(&[("locationDbIds", &["80"]), ("studyTypes", &["AYT"])]));
        let b = QueryDescriptor::get("studies")
            .with_params(params(&[("studyTypes", &["AYT"]), ("locationDbIds", &["80"])]));
        assert_ne!(a.cache_key_material(), b.cache_key_material());
    }

    #[test]
    fn result_ids_differ_for_identical_queries() {
        let query = QueryDescriptor::get("germplasm");
        let first = derive_result_id(&query);
        let second = derive_result_id(&query);
        assert_eq!(first.len(), RESULT_ID_HEX_LEN);
        assert_ne!(first, second, "salt must keep repeated queries distinct");
    }

    #[test]
    fn result_ids_are_stable_for_fixed_salt() {
        let query =
            QueryDescriptor::search("locations", params(&[("countryNames", &["Mozambique"])]));
        let first = derive_result_id_salted(&query, &[1, 2, 3, 4]);
        let second = derive_result_id_salted(&query, &[1, 2, 3, 4]);
        assert_eq!(first, second);
    }

    #[test]
    fn summary_mirrors_result_set_counts() {
        let set = ResultSet {
            session_id: "abc12345".into(),
            result_id: "deadbeefdeadbeef".into(),
            columns: vec!["germplasmDbId".into(), "germplasmName".into()],
            rows: vec![Record::new()],
            total_matches: 66,
            returned_count: 1,
            truncated: true,
            created_at: 0,
        };
        let summary = ResultSummary::of(&set, 128);
        assert_eq!(summary.column_count, 2);
        assert_eq!(summary.row_count, 1);
        assert!(summary.truncated);
        assert_eq!(summary.approx_size_bytes, 128);
    }
}
