//! MCP tools for BrAPI backends.
//!
//! Gives agents bounded, cached access to a BrAPI server: queries run
//! server-side, land in the session result cache, and come back as a
//! lightweight handle instead of an unbounded payload.

use brapi_protocol::{ErrorEnvelope, ParamMap, QueryDescriptor};
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::engine::{error_envelope, BrapiEngine, EngineError};

/// Sub-resources the generic GET path accepts, as in the original tool set.
const VALID_SUB_RESOURCES: &[&str] = &["calls", "callsets", "variants"];

const DEFAULT_MAX_RESULTS: usize = 100;
const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Clone)]
pub struct BrapiService {
    engine: Arc<BrapiEngine>,
    tool_router: ToolRouter<Self>,
}

impl BrapiService {
    pub fn new(engine: Arc<BrapiEngine>) -> Self {
        Self {
            engine,
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_handler]
impl ServerHandler for BrapiService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some("BrAPI query tools with a session result cache. Use 'brapi_get' or 'brapi_search' to run a query; both return a result_id handle instead of raw data. Follow up with 'result_summary' to inspect shape, 'load_result' for bounded slices, and 'export_location' for the full CSV path.".into()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            ..Default::default()
        }
    }
}

// ============================================================================
// Tool Input/Output Schemas
// ============================================================================

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct BrapiGetRequest {
    /// Session scope; omit to start a fresh session
    #[schemars(description = "Session id; omit to create a new session")]
    pub session_id: Option<String>,

    /// Service name, e.g. 'germplasm', 'studies', 'observations'
    #[schemars(description = "BrAPI service endpoint name")]
    pub service: String,

    /// Specific resource id (optional)
    #[schemars(description = "Single resource id appended to the path")]
    pub db_id: Option<String>,

    /// Sub-resource: 'calls', 'callsets' or 'variants' (requires db_id)
    #[schemars(description = "Sub-resource path segment (calls, callsets, variants)")]
    pub sub: Option<String>,

    /// Query parameters: {name: value} or {name: [values...]}
    #[schemars(description = "Filter parameters for the endpoint")]
    pub params: Option<serde_json::Value>,

    /// Maximum records to retrieve (default 100, server-capped)
    #[schemars(description = "Cap on retrieved records")]
    pub max_results: Option<usize>,

    /// Upstream page size (default 100)
    #[schemars(description = "Records per upstream page")]
    pub page_size: Option<u32>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct BrapiSearchRequest {
    /// Session scope; omit to start a fresh session
    #[schemars(description = "Session id; omit to create a new session")]
    pub session_id: Option<String>,

    /// Service name to search, e.g. 'studies', 'germplasm'
    #[schemars(description = "BrAPI service to search")]
    pub service: String,

    /// Search filters: {name: value} or {name: [values...]}
    #[schemars(description = "Search parameters posted to search/{service}")]
    pub search_params: serde_json::Value,

    /// Maximum records to retrieve (default 100, server-capped)
    #[schemars(description = "Cap on retrieved records")]
    pub max_results: Option<usize>,

    /// Upstream page size (default 100)
    #[schemars(description = "Records per upstream page")]
    pub page_size: Option<u32>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ResultRefRequest {
    #[schemars(description = "Session id")]
    pub session_id: String,

    #[schemars(description = "Result id returned by brapi_get/brapi_search")]
    pub result_id: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct LoadResultRequest {
    #[schemars(description = "Session id")]
    pub session_id: String,

    #[schemars(description = "Result id returned by brapi_get/brapi_search")]
    pub result_id: String,

    /// Columns to project (default: all)
    #[schemars(description = "Subset of columns to return")]
    pub columns: Option<Vec<String>>,

    /// Maximum rows to return
    #[schemars(description = "Row limit for this slice")]
    pub limit: Option<usize>,

    /// Rows to skip (for paging through the cached result)
    #[schemars(description = "Row offset for this slice")]
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ListResultsRequest {
    #[schemars(description = "Session id")]
    pub session_id: String,
}

#[derive(Debug, Serialize)]
struct LoadResultResponse {
    result_id: String,
    columns: Vec<String>,
    returned_rows: usize,
    offset: usize,
    rows: Vec<brapi_protocol::Record>,
}

#[derive(Debug, Serialize)]
struct ExportLocationResponse {
    session_id: String,
    result_id: String,
    path: String,
}

#[derive(Debug, Serialize)]
struct ListResultsResponse {
    session_id: String,
    total_results: usize,
    results: Vec<brapi_protocol::ResultSummary>,
}

#[derive(Debug, Serialize)]
struct DeleteResultResponse {
    result_id: String,
    deleted: bool,
}

// ============================================================================
// Tools
// ============================================================================

#[tool_router]
impl BrapiService {
    #[tool(
        description = "Fetch data from any BrAPI GET endpoint into the session cache. Returns a result_id handle plus a summary (columns, counts, truncation) - never raw rows."
    )]
    pub async fn brapi_get(
        &self,
        Parameters(request): Parameters<BrapiGetRequest>,
    ) -> Result<CallToolResult, McpError> {
        let params = match params_from_value(request.params.as_ref()) {
            Ok(params) => params,
            Err(message) => return Ok(invalid_params(&message)),
        };

        if let Some(sub) = request.sub.as_deref() {
            if !VALID_SUB_RESOURCES.contains(&sub) {
                return Ok(invalid_params(&format!(
                    "Invalid sub-resource '{sub}'; expected one of {VALID_SUB_RESOURCES:?}"
                )));
            }
            if request.db_id.is_none() {
                return Ok(invalid_params(&format!(
                    "Sub-resource '{sub}' requires db_id"
                )));
            }
        }

        let mut query = QueryDescriptor::get(&request.service).with_params(params);
        if let Some(db_id) = request.db_id.as_deref() {
            query = query.with_id(db_id);
        }
        if let Some(sub) = request.sub.as_deref() {
            query = query.with_sub_resource(sub);
        }

        self.run_fetch(request.session_id.as_deref(), query, request.max_results, request.page_size)
            .await
    }

    #[tool(
        description = "Search a BrAPI service via POST search/{service} and cache the results. Returns a result_id handle plus a summary - never raw rows."
    )]
    pub async fn brapi_search(
        &self,
        Parameters(request): Parameters<BrapiSearchRequest>,
    ) -> Result<CallToolResult, McpError> {
        let params = match params_from_value(Some(&request.search_params)) {
            Ok(params) if !params.is_empty() => params,
            Ok(_) => return Ok(invalid_params("search_params must name at least one filter")),
            Err(message) => return Ok(invalid_params(&message)),
        };

        let query = QueryDescriptor::search(&request.service, params);
        self.run_fetch(request.session_id.as_deref(), query, request.max_results, request.page_size)
            .await
    }

    #[tool(
        description = "Summary of a cached result without loading row data: columns, row count, total matches, truncation, approximate size."
    )]
    pub async fn result_summary(
        &self,
        Parameters(request): Parameters<ResultRefRequest>,
    ) -> Result<CallToolResult, McpError> {
        match self.engine.summary(&request.session_id, &request.result_id) {
            Ok(summary) => Ok(ok_json(&summary)),
            Err(err) => Ok(fail(&err)),
        }
    }

    #[tool(
        description = "Load a slice of a cached result. Use columns/limit/offset to keep the slice small; identical arguments always return identical rows."
    )]
    pub async fn load_result(
        &self,
        Parameters(request): Parameters<LoadResultRequest>,
    ) -> Result<CallToolResult, McpError> {
        let offset = request.offset.unwrap_or(0);
        match self.engine.load(
            &request.session_id,
            &request.result_id,
            request.columns.as_deref(),
            request.limit,
            offset,
        ) {
            Ok(loaded) => Ok(ok_json(&LoadResultResponse {
                result_id: request.result_id,
                columns: loaded.columns,
                returned_rows: loaded.rows.len(),
                offset,
                rows: loaded.rows,
            })),
            Err(err) => Ok(fail(&err)),
        }
    }

    #[tool(
        description = "Filesystem path of the cached result's CSV export. The path is derivable from the two ids alone."
    )]
    pub async fn export_location(
        &self,
        Parameters(request): Parameters<ResultRefRequest>,
    ) -> Result<CallToolResult, McpError> {
        match self
            .engine
            .export_location(&request.session_id, &request.result_id)
        {
            Ok(path) => Ok(ok_json(&ExportLocationResponse {
                session_id: request.session_id,
                result_id: request.result_id,
                path: path.display().to_string(),
            })),
            Err(err) => Ok(fail(&err)),
        }
    }

    #[tool(description = "List every cached result in a session, oldest first.")]
    pub async fn list_results(
        &self,
        Parameters(request): Parameters<ListResultsRequest>,
    ) -> Result<CallToolResult, McpError> {
        match self.engine.list_results(&request.session_id) {
            Ok(results) => Ok(ok_json(&ListResultsResponse {
                session_id: request.session_id,
                total_results: results.len(),
                results,
            })),
            Err(err) => Ok(fail(&err)),
        }
    }

    #[tool(description = "Delete one cached result from a session.")]
    pub async fn delete_result(
        &self,
        Parameters(request): Parameters<ResultRefRequest>,
    ) -> Result<CallToolResult, McpError> {
        match self
            .engine
            .delete_result(&request.session_id, &request.result_id)
        {
            Ok(deleted) => Ok(ok_json(&DeleteResultResponse {
                result_id: request.result_id,
                deleted,
            })),
            Err(err) => Ok(fail(&err)),
        }
    }
}

impl BrapiService {
    async fn run_fetch(
        &self,
        session_id: Option<&str>,
        query: QueryDescriptor,
        max_results: Option<usize>,
        page_size: Option<u32>,
    ) -> Result<CallToolResult, McpError> {
        let max_results = max_results.unwrap_or(DEFAULT_MAX_RESULTS);
        let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE);

        match self
            .engine
            .fetch_and_cache(session_id, query, max_results, page_size)
            .await
        {
            Ok(outcome) => Ok(ok_json(&outcome)),
            Err(err) => Ok(fail(&err)),
        }
    }
}

/// Accepts `{name: "value"}` and `{name: ["v1", "v2"]}` parameter shapes;
/// scalars are stringified the way the upstream expects them on the wire.
fn params_from_value(value: Option<&serde_json::Value>) -> Result<ParamMap, String> {
    let mut params = ParamMap::new();
    let Some(value) = value else {
        return Ok(params);
    };
    let serde_json::Value::Object(map) = value else {
        return Err("params must be a JSON object".to_string());
    };

    for (name, entry) in map {
        let values = match entry {
            serde_json::Value::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(scalar_to_string(item).ok_or_else(|| {
                        format!("Parameter '{name}' contains a non-scalar list element")
                    })?);
                }
                values
            }
            serde_json::Value::Null => continue,
            scalar => vec![scalar_to_string(scalar)
                .ok_or_else(|| format!("Parameter '{name}' must be a scalar or list"))?],
        };
        params.insert(name.clone(), values);
    }
    Ok(params)
}

fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(text) => Some(text.clone()),
        serde_json::Value::Number(number) => Some(number.to_string()),
        serde_json::Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn ok_json<T: Serialize>(value: &T) -> CallToolResult {
    CallToolResult::success(vec![Content::text(
        serde_json::to_string_pretty(value).unwrap_or_default(),
    )])
}

fn fail(err: &EngineError) -> CallToolResult {
    let envelope = error_envelope(err);
    CallToolResult::error(vec![Content::text(
        serde_json::to_string_pretty(&envelope).unwrap_or_default(),
    )])
}

fn invalid_params(message: &str) -> CallToolResult {
    let envelope = ErrorEnvelope::new("invalid_params", message);
    CallToolResult::error(vec![Content::text(
        serde_json::to_string_pretty(&envelope).unwrap_or_default(),
    )])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_accept_scalars_and_lists() {
        let value = json!({
            "countryNames": ["Mozambique", "Uganda"],
            "pageDepth": 3,
            "active": true,
            "skipped": null
        });
        let params = params_from_value(Some(&value)).expect("parse");
        assert_eq!(
            params.get("countryNames"),
            Some(&vec!["Mozambique".to_string(), "Uganda".to_string()])
        );
        assert_eq!(params.get("pageDepth"), Some(&vec!["3".to_string()]));
        assert_eq!(params.get("active"), Some(&vec!["true".to_string()]));
        assert!(!params.contains_key("skipped"));
    }

    #[test]
    fn nested_params_are_rejected() {
        let value = json!({"filter": {"nested": true}});
        assert!(params_from_value(Some(&value)).is_err());
        assert!(params_from_value(Some(&json!("not-an-object"))).is_err());
    }
}
