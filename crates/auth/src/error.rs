use thiserror::Error;

pub type Result<T> = std::result::Result<T, AuthError>;

#[derive(Error, Debug)]
pub enum AuthError {
    /// Upstream token endpoint rejected the username/password (401/403).
    #[error("Invalid credentials: upstream rejected the login")]
    InvalidCredentials,

    /// Token endpoint unreachable or misbehaving (network failure, 5xx,
    /// malformed grant response).
    #[error("Auth unavailable: {0}")]
    AuthUnavailable(String),

    /// No credential held and no username/password configured to obtain one.
    #[error("Not authenticated: no credential and no login configured")]
    NotAuthenticated,
}
