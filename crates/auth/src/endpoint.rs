//! Token-endpoint seam.
//!
//! SGN-based BrAPI servers (Sweetpotatobase, Cassavabase, Yambase, ...) use a
//! password-grant token endpoint at `{base}/token`. The trait keeps the
//! network edge mockable; the manager only sees granted tokens.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{AuthError, Result};

/// Server TTL applied when the grant omits `expires_in`.
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 7_200;

const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One successful password grant.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in: u64,
    pub user_display_name: Option<String>,
}

#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn request_token(&self, username: &str, password: &str) -> Result<TokenGrant>;
}

/// SGN password-grant endpoint over HTTP.
pub struct HttpTokenEndpoint {
    http: reqwest::Client,
    token_url: String,
}

#[derive(Debug, Deserialize)]
struct GrantResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    #[serde(rename = "userDisplayName")]
    user_display_name: Option<String>,
}

impl HttpTokenEndpoint {
    /// `base_url` is the API root, e.g. `https://sweetpotatobase.org/brapi/v2`.
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .build()
            .map_err(|err| AuthError::AuthUnavailable(err.to_string()))?;
        Ok(Self {
            http,
            token_url: format!("{}/token", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn request_token(&self, username: &str, password: &str) -> Result<TokenGrant> {
        let form = [
            ("grant_type", "password"),
            ("username", username),
            ("password", password),
        ];

        let response = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|err| AuthError::AuthUnavailable(err.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(AuthError::InvalidCredentials);
        }
        if !status.is_success() {
            return Err(AuthError::AuthUnavailable(format!(
                "token endpoint returned {status}"
            )));
        }

        let grant: GrantResponse = response
            .json()
            .await
            .map_err(|err| AuthError::AuthUnavailable(format!("malformed grant: {err}")))?;

        let access_token = grant
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                AuthError::AuthUnavailable("server did not return an access token".to_string())
            })?;

        Ok(TokenGrant {
            access_token,
            expires_in: grant.expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS),
            user_display_name: grant.user_display_name,
        })
    }
}
