//! Credential lifecycle: login, expiry tracking, single-flighted refresh,
//! durable reuse across process restarts.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use brapi_protocol::unix_now;
use tokio::sync::Mutex;

use crate::endpoint::TokenEndpoint;
use crate::error::{AuthError, Result};

/// Refresh this long before the server-reported expiry to keep in-flight
/// page requests from racing the deadline.
pub const SAFETY_MARGIN: Duration = Duration::from_secs(60);

/// A bearer credential with its validity window. Owned exclusively by the
/// manager; components hold only the token value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub value: String,
    /// Unix seconds.
    pub issued_at: u64,
    /// Unix seconds.
    pub expires_at: u64,
}

impl Credential {
    pub fn is_fresh_at(&self, now: u64, margin: Duration) -> bool {
        now + margin.as_secs() < self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Valid,
    Refreshing,
    Expired,
}

/// Owns one upstream connection's credential.
///
/// SGN servers issue no refresh token, so refresh is a re-login with the
/// username/password the manager was constructed with. All refresh paths
/// funnel through one async mutex: concurrent callers share a single
/// in-flight grant and observe its outcome.
pub struct CredentialManager {
    endpoint: Arc<dyn TokenEndpoint>,
    username: String,
    password: String,
    safety_margin: Duration,
    token_path: Option<PathBuf>,
    credential: RwLock<Option<Credential>>,
    refresh_gate: Mutex<()>,
    refreshing: AtomicBool,
}

impl CredentialManager {
    pub fn new(
        endpoint: Arc<dyn TokenEndpoint>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint,
            username: username.into(),
            password: password.into(),
            safety_margin: SAFETY_MARGIN,
            token_path: None,
            credential: RwLock::new(None),
            refresh_gate: Mutex::new(()),
            refreshing: AtomicBool::new(false),
        }
    }

    /// Enable durable token storage at `path` and adopt a persisted
    /// credential if one is still fresh, so a restarted process does not
    /// re-prompt the upstream.
    pub fn with_token_path(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if let Some(cred) = load_persisted(&path, self.safety_margin) {
            log::info!("Reusing persisted credential from {}", path.display());
            *self.credential.write().expect("credential lock poisoned") = Some(cred);
        }
        self.token_path = Some(path);
        self
    }

    pub fn refresh_state(&self) -> RefreshState {
        if self.refreshing.load(Ordering::SeqCst) {
            return RefreshState::Refreshing;
        }
        match self.read_credential() {
            Some(cred) if cred.is_fresh_at(unix_now(), self.safety_margin) => RefreshState::Valid,
            _ => RefreshState::Expired,
        }
    }

    pub fn current(&self) -> Option<Credential> {
        self.read_credential()
    }

    /// Explicit login with the configured username/password.
    pub async fn authenticate(&self) -> Result<Credential> {
        let _gate = self.refresh_gate.lock().await;
        self.grant().await
    }

    /// Bearer token for the next outgoing request. Fast path returns the
    /// held credential; expired or in-margin credentials trigger one shared
    /// refresh for all concurrent callers.
    pub async fn ensure_valid(&self) -> Result<String> {
        if let Some(cred) = self.read_credential() {
            if cred.is_fresh_at(unix_now(), self.safety_margin) {
                return Ok(cred.value);
            }
        }
        self.refresh(None).await.map(|cred| cred.value)
    }

    /// Recovery path for a 401 on an actual page request: the server
    /// invalidated `stale_token` early. If another caller already replaced
    /// it, the replacement is returned without a second network grant.
    pub async fn force_refresh(&self, stale_token: &str) -> Result<String> {
        self.refresh(Some(stale_token)).await.map(|cred| cred.value)
    }

    async fn refresh(&self, stale_token: Option<&str>) -> Result<Credential> {
        let _gate = self.refresh_gate.lock().await;

        // Re-check after winning the gate: the previous holder may have
        // refreshed while this caller was queued.
        if let Some(cred) = self.read_credential() {
            let superseded = stale_token.map_or(true, |stale| cred.value != stale);
            if superseded && cred.is_fresh_at(unix_now(), self.safety_margin) {
                return Ok(cred);
            }
        }

        self.grant().await
    }

    /// One network grant. Callers must hold `refresh_gate`.
    async fn grant(&self) -> Result<Credential> {
        if self.username.is_empty() {
            return Err(AuthError::NotAuthenticated);
        }

        self.refreshing.store(true, Ordering::SeqCst);
        let outcome = self
            .endpoint
            .request_token(&self.username, &self.password)
            .await;
        self.refreshing.store(false, Ordering::SeqCst);

        match outcome {
            Ok(grant) => {
                let now = unix_now();
                let cred = Credential {
                    value: grant.access_token,
                    issued_at: now,
                    expires_at: now + grant.expires_in,
                };
                if let Some(name) = grant.user_display_name.as_deref() {
                    log::info!("Authenticated as {name}");
                }
                self.store_credential(Some(cred.clone()));
                Ok(cred)
            }
            Err(err) => {
                if matches!(err, AuthError::InvalidCredentials) {
                    // Revoked upstream: drop the dead credential entirely.
                    self.store_credential(None);
                }
                log::warn!("Credential refresh failed: {err}");
                Err(err)
            }
        }
    }

    fn read_credential(&self) -> Option<Credential> {
        self.credential
            .read()
            .expect("credential lock poisoned")
            .clone()
    }

    fn store_credential(&self, cred: Option<Credential>) {
        *self.credential.write().expect("credential lock poisoned") = cred.clone();

        let Some(path) = self.token_path.as_deref() else {
            return;
        };
        let result = match cred {
            Some(cred) => persist(path, &cred),
            None => remove_persisted(path),
        };
        // Persistence is best-effort: the in-memory credential stays
        // authoritative for this process.
        if let Err(err) = result {
            log::warn!("Could not update token file {}: {err}", path.display());
        }
    }
}

fn persist(path: &Path, cred: &Credential) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(cred)?;
    std::fs::write(path, bytes)
}

fn remove_persisted(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn load_persisted(path: &Path, margin: Duration) -> Option<Credential> {
    let bytes = std::fs::read(path).ok()?;
    let cred: Credential = match serde_json::from_slice(&bytes) {
        Ok(cred) => cred,
        Err(err) => {
            log::warn!("Token file corrupted {}: {err}", path.display());
            return None;
        }
    };
    cred.is_fresh_at(unix_now(), margin).then_some(cred)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::TokenGrant;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingEndpoint {
        calls: AtomicUsize,
        fail_invalid: bool,
    }

    impl CountingEndpoint {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_invalid: false,
            })
        }

        fn rejecting() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_invalid: true,
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenEndpoint for CountingEndpoint {
        async fn request_token(&self, _username: &str, _password: &str) -> Result<TokenGrant> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            // Hold the grant open long enough for contending callers to
            // queue on the gate.
            tokio::time::sleep(Duration::from_millis(25)).await;
            if self.fail_invalid {
                return Err(AuthError::InvalidCredentials);
            }
            Ok(TokenGrant {
                access_token: format!("tok-{n}"),
                expires_in: 7_200,
                user_display_name: None,
            })
        }
    }

    fn write_token_file(dir: &tempfile::TempDir, cred: &Credential) -> PathBuf {
        let path = dir.path().join("token.json");
        std::fs::write(&path, serde_json::to_vec(cred).expect("serialize")).expect("write token");
        path
    }

    fn expired_credential() -> Credential {
        let now = unix_now();
        Credential {
            value: "tok-old".to_string(),
            issued_at: now.saturating_sub(7_300),
            expires_at: now.saturating_sub(100),
        }
    }

    fn fresh_credential(value: &str) -> Credential {
        let now = unix_now();
        Credential {
            value: value.to_string(),
            issued_at: now,
            expires_at: now + 7_200,
        }
    }

    #[tokio::test]
    async fn concurrent_ensure_valid_share_one_refresh() {
        let endpoint = CountingEndpoint::new();
        let manager = Arc::new(CredentialManager::new(endpoint.clone(), "user", "pass"));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.ensure_valid().await }));
        }

        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.expect("join").expect("ensure_valid"));
        }

        assert_eq!(endpoint.call_count(), 1);
        assert!(tokens.iter().all(|token| token == "tok-1"));
    }

    #[tokio::test]
    async fn expired_persisted_credential_triggers_one_refresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_token_file(&dir, &expired_credential());

        let endpoint = CountingEndpoint::new();
        let manager =
            CredentialManager::new(endpoint.clone(), "user", "pass").with_token_path(&path);

        let token = manager.ensure_valid().await.expect("ensure_valid");
        assert_eq!(token, "tok-1");
        assert_eq!(endpoint.call_count(), 1);
    }

    #[tokio::test]
    async fn fresh_persisted_credential_skips_network() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_token_file(&dir, &fresh_credential("tok-disk"));

        let endpoint = CountingEndpoint::new();
        let manager =
            CredentialManager::new(endpoint.clone(), "user", "pass").with_token_path(&path);

        let token = manager.ensure_valid().await.expect("ensure_valid");
        assert_eq!(token, "tok-disk");
        assert_eq!(endpoint.call_count(), 0);
        assert_eq!(manager.refresh_state(), RefreshState::Valid);
    }

    #[tokio::test]
    async fn force_refresh_reuses_replacement_token() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_token_file(&dir, &fresh_credential("tok-live"));

        let endpoint = CountingEndpoint::new();
        let manager =
            CredentialManager::new(endpoint.clone(), "user", "pass").with_token_path(&path);

        // Another caller already replaced the token this caller saw 401 on.
        let token = manager.force_refresh("tok-stale").await.expect("refresh");
        assert_eq!(token, "tok-live");
        assert_eq!(endpoint.call_count(), 0);

        // The live token itself was rejected: a network grant is required.
        let token = manager.force_refresh("tok-live").await.expect("refresh");
        assert_eq!(token, "tok-1");
        assert_eq!(endpoint.call_count(), 1);
    }

    #[tokio::test]
    async fn rejected_login_clears_held_credential() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_token_file(&dir, &expired_credential());

        let endpoint = CountingEndpoint::rejecting();
        let manager = CredentialManager::new(endpoint, "user", "wrong").with_token_path(&path);

        let err = manager.ensure_valid().await.expect_err("must fail");
        assert!(matches!(err, AuthError::InvalidCredentials));
        assert!(manager.current().is_none());
        assert_eq!(manager.refresh_state(), RefreshState::Expired);
        assert!(!path.exists(), "revoked token file must be removed");
    }

    #[tokio::test]
    async fn authenticate_persists_for_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("token.json");

        let endpoint = CountingEndpoint::new();
        let manager =
            CredentialManager::new(endpoint.clone(), "user", "pass").with_token_path(&path);
        manager.authenticate().await.expect("authenticate");
        assert_eq!(endpoint.call_count(), 1);

        // Restarted process: a new manager adopts the stored credential.
        let endpoint2 = CountingEndpoint::new();
        let restarted =
            CredentialManager::new(endpoint2.clone(), "user", "pass").with_token_path(&path);
        let token = restarted.ensure_valid().await.expect("ensure_valid");
        assert_eq!(token, "tok-1");
        assert_eq!(endpoint2.call_count(), 0);
    }
}
