//! Environment-driven server configuration.
//!
//! One process serves one upstream; running two backends means running two
//! processes with two configurations, each with its own component graph.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Tool-layer ceiling on `max_results`; callers wanting more must raise it
/// explicitly via `BRAPI_MAX_RESULTS_CAP`.
pub const DEFAULT_MAX_RESULTS_CAP: usize = 500;

const DEFAULT_RETENTION_DAYS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_name: String,
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub data_dir: PathBuf,
    pub retention: Duration,
    pub max_results_cap: usize,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("BRAPI_BASE_URL")
            .context("BRAPI_BASE_URL is required (e.g. https://sweetpotatobase.org/brapi/v2)")?;
        if !base_url.starts_with("http") {
            bail!("BRAPI_BASE_URL must be an http(s) URL, got '{base_url}'");
        }

        let server_name =
            std::env::var("BRAPI_SERVER_NAME").unwrap_or_else(|_| host_of(&base_url));
        let username = std::env::var("BRAPI_USERNAME").unwrap_or_default();
        let password = std::env::var("BRAPI_PASSWORD").unwrap_or_default();

        let data_dir = match std::env::var("BRAPI_DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("brapi-mcp"),
        };

        let retention_days = match std::env::var("BRAPI_RETENTION_DAYS") {
            Ok(raw) => raw
                .parse::<u64>()
                .with_context(|| format!("BRAPI_RETENTION_DAYS must be a day count, got '{raw}'"))?,
            Err(_) => DEFAULT_RETENTION_DAYS,
        };

        let max_results_cap = match std::env::var("BRAPI_MAX_RESULTS_CAP") {
            Ok(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("BRAPI_MAX_RESULTS_CAP must be a count, got '{raw}'"))?,
            Err(_) => DEFAULT_MAX_RESULTS_CAP,
        };

        Ok(Self {
            server_name,
            base_url: base_url.trim_end_matches('/').to_string(),
            username,
            password,
            data_dir,
            retention: Duration::from_secs(retention_days * 86_400),
            max_results_cap,
        })
    }

    /// One durable credential record per upstream base URL.
    pub fn token_path(&self) -> PathBuf {
        self.data_dir
            .join("tokens")
            .join(format!("{}.json", sanitize(&host_of(&self.base_url))))
    }
}

fn host_of(base_url: &str) -> String {
    let stripped = base_url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    stripped
        .split('/')
        .next()
        .unwrap_or(stripped)
        .to_string()
}

fn sanitize(host: &str) -> String {
    host.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
            c
        } else {
            '_'
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_extraction_handles_paths_and_ports() {
        assert_eq!(
            host_of("https://sweetpotatobase.org/brapi/v2"),
            "sweetpotatobase.org"
        );
        assert_eq!(host_of("http://localhost:8080/brapi/v2"), "localhost:8080");
    }

    #[test]
    fn token_path_is_per_host() {
        let config = ServerConfig {
            server_name: "spb".into(),
            base_url: "http://localhost:8080/brapi/v2".into(),
            username: String::new(),
            password: String::new(),
            data_dir: PathBuf::from("/data"),
            retention: Duration::from_secs(86_400),
            max_results_cap: 500,
        };
        assert_eq!(
            config.token_path(),
            PathBuf::from("/data/tokens/localhost_8080.json")
        );
    }
}
