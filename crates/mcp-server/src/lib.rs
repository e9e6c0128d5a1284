//! BrAPI MCP Server
//!
//! Exposes bounded, cached BrAPI queries to AI agents via MCP.
//!
//! ## Tools
//!
//! - `brapi_get` / `brapi_search` - run a query, cache the result, return a handle
//! - `result_summary` - shape of a cached result without its rows
//! - `load_result` - projected/sliced rows from a cached result
//! - `export_location` - path of the CSV export
//! - `list_results` / `delete_result` - session cache management
//!
//! ## Usage
//!
//! Add to your MCP client configuration:
//! ```json
//! {
//!   "mcpServers": {
//!     "sweetpotatobase": {
//!       "command": "brapi-mcp",
//!       "env": {
//!         "BRAPI_BASE_URL": "https://sweetpotatobase.org/brapi/v2",
//!         "BRAPI_USERNAME": "...",
//!         "BRAPI_PASSWORD": "..."
//!       }
//!     }
//!   }
//! }
//! ```

use anyhow::Result;
use rmcp::transport::stdio;
use rmcp::ServiceExt;
use std::sync::Arc;
use std::time::Duration;

pub mod config;
pub mod engine;
pub mod tools;

pub use config::ServerConfig;
pub use engine::{BrapiEngine, EngineError, FetchAndCacheOutcome};
pub use tools::BrapiService;

const SWEEP_INTERVAL: Duration = Duration::from_secs(86_400);

pub async fn main_entry() -> Result<()> {
    // Configure logging to stderr only (stdout is for MCP protocol)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = ServerConfig::from_env()?;
    log::info!(
        "Starting BrAPI MCP server for {} ({})",
        config.server_name,
        config.base_url
    );

    let engine = Arc::new(BrapiEngine::new(&config)?);

    // Startup sweep, then a daily cadence. Sweep failures are logged, not
    // fatal: a full disk should not take the query path down with it.
    match engine.evict_expired() {
        Ok(evicted) if evicted > 0 => log::info!("Startup sweep evicted {evicted} result(s)"),
        Ok(_) => {}
        Err(err) => log::warn!("Startup sweep failed: {err}"),
    }
    tokio::spawn({
        let engine = engine.clone();
        async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await; // immediate first tick already handled above
            loop {
                ticker.tick().await;
                if let Err(err) = engine.evict_expired() {
                    log::warn!("Retention sweep failed: {err}");
                }
            }
        }
    });

    let service = BrapiService::new(engine);
    let server = service.serve(stdio()).await?;
    server.waiting().await?;

    log::info!("BrAPI MCP server stopped");
    Ok(())
}
