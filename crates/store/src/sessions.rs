//! Durable session registry: sessions survive server restarts.

use brapi_protocol::{Session, unix_now};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use crate::error::{Result, StoreError};
use crate::result_store::ResultStore;

const REGISTRY_FILE: &str = "sessions.json";
const SESSIONS_DIR: &str = "sessions";

pub struct SessionRegistry {
    root: PathBuf,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionRegistry {
    /// Open (or create) the registry under `root`. A corrupt registry file
    /// is a storage error, not an empty registry: silently starting over
    /// would orphan every cached result on disk.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(SESSIONS_DIR))?;

        let registry_path = root.join(REGISTRY_FILE);
        let sessions = if registry_path.exists() {
            let bytes = std::fs::read(&registry_path)?;
            serde_json::from_slice(&bytes)?
        } else {
            HashMap::new()
        };

        Ok(Self {
            root,
            sessions: RwLock::new(sessions),
        })
    }

    /// Look up an explicit session id, or mint a fresh session when none is
    /// given. Fresh ids are 8 hex chars, like the original server's
    /// truncated uuids.
    pub fn get_or_create(
        &self,
        session_id: Option<&str>,
        name: &str,
        base_url: &str,
    ) -> Result<Session> {
        let mut sessions = self.sessions.write().expect("session lock poisoned");

        let session_id = match session_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => loop {
                let candidate = random_session_id();
                if !sessions.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        if let Some(existing) = sessions.get(&session_id) {
            return Ok(existing.clone());
        }

        let session = Session {
            session_id: session_id.clone(),
            name: name.to_string(),
            base_url: base_url.to_string(),
            created_at: unix_now(),
        };
        sessions.insert(session_id, session.clone());
        self.save(&sessions)?;
        log::info!("Created session {} ({})", session.session_id, session.name);
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> Result<Session> {
        self.sessions
            .read()
            .expect("session lock poisoned")
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownSessionOrResult(session_id.to_string()))
    }

    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .expect("session lock poisoned")
            .values()
            .cloned()
            .collect();
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }

    /// Result store for a known session.
    pub fn store_for(&self, session_id: &str) -> Result<ResultStore> {
        let session = self.get(session_id)?;
        ResultStore::open(self.session_dir(&session.session_id))
    }

    /// Age-sweep every session's results. Sessions themselves are never
    /// auto-deleted; only their cached results expire.
    pub fn evict_all_expired(&self, retention: Duration) -> Result<usize> {
        let mut evicted = 0;
        for session in self.list() {
            let store = ResultStore::open(self.session_dir(&session.session_id))?;
            evicted += store.evict_expired(retention)?;
        }
        Ok(evicted)
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(SESSIONS_DIR).join(session_id)
    }

    /// Registry writes go through a staging file and a rename, same
    /// discipline as result publication.
    fn save(&self, sessions: &HashMap<String, Session>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(sessions)?;
        let staging = self.root.join(format!("{REGISTRY_FILE}.tmp"));
        std::fs::write(&staging, bytes)?;
        std::fs::rename(&staging, self.root.join(REGISTRY_FILE))?;
        Ok(())
    }
}

fn random_session_id() -> String {
    let mut bytes = [0u8; 4];
    if getrandom::getrandom(&mut bytes).is_err() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.subsec_nanos());
        bytes = nanos.to_be_bytes();
    }
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");

        let registry = SessionRegistry::open(dir.path()).expect("open");
        let session = registry
            .get_or_create(None, "sweetpotatobase", "https://sweetpotatobase.org/brapi/v2")
            .expect("create");
        assert_eq!(session.session_id.len(), 8);

        let reopened = SessionRegistry::open(dir.path()).expect("reopen");
        let found = reopened.get(&session.session_id).expect("persisted");
        assert_eq!(found.name, "sweetpotatobase");
    }

    #[test]
    fn explicit_id_is_reused_not_recreated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = SessionRegistry::open(dir.path()).expect("open");

        let first = registry
            .get_or_create(Some("agent-a"), "spb", "https://x/brapi/v2")
            .expect("create");
        let second = registry
            .get_or_create(Some("agent-a"), "renamed", "https://y/brapi/v2")
            .expect("reuse");
        assert_eq!(first.session_id, second.session_id);
        // The original registration wins; get_or_create never mutates.
        assert_eq!(second.name, "spb");
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn unknown_session_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = SessionRegistry::open(dir.path()).expect("open");
        let err = registry.get("missing1").expect_err("must fail");
        assert!(matches!(err, StoreError::UnknownSessionOrResult(_)));
        assert!(registry.store_for("missing1").is_err());
    }
}
