//! In-memory credential store for development and testing

use crate::{validate_session_id, CredentialState, CredentialStore, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// In-memory credential store
#[derive(Debug, Default, Clone)]
pub struct MemoryCredentialStore {
    /// Per-session credentials
    records: Arc<DashMap<String, CredentialState>>,
}

impl MemoryCredentialStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with the given identities (fresh credentials)
    pub fn with_sessions<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        for id in ids {
            store.records.insert(id.into(), CredentialState::fresh());
        }
        store
    }

    /// Current record of a session, if any
    pub fn get(&self, session_id: &str) -> Option<CredentialState> {
        self.records.get(session_id).map(|r| r.clone())
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self, session_id: &str) -> Result<CredentialState, StorageError> {
        validate_session_id(session_id)?;
        let state = self
            .records
            .entry(session_id.to_string())
            .or_insert_with(CredentialState::fresh)
            .clone();
        debug!("MemoryStore load session={} registered={}", session_id, state.registered);
        Ok(state)
    }

    async fn save(&self, session_id: &str, state: &CredentialState) -> Result<(), StorageError> {
        validate_session_id(session_id)?;
        debug!("MemoryStore save session={}", session_id);
        self.records.insert(session_id.to_string(), state.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut ids: Vec<String> = self.records.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }

    async fn remove(&self, session_id: &str) -> Result<(), StorageError> {
        self.records.remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_creates_fresh_record() {
        let store = MemoryCredentialStore::new();
        assert!(store.list().await.unwrap().is_empty());

        let state = store.load("s1").await.unwrap();
        assert!(!state.registered);
        assert_eq!(store.list().await.unwrap(), vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let store = MemoryCredentialStore::new();
        let mut state = CredentialState::fresh();
        state.registered = true;
        state
            .material
            .insert("me".to_string(), serde_json::json!("123@s.whatsapp.net"));

        store.save("s1", &state).await.unwrap();
        assert_eq!(store.load("s1").await.unwrap(), state);

        store.remove("s1").await.unwrap();
        assert!(store.get("s1").is_none());
    }

    #[tokio::test]
    async fn test_with_sessions_lists_sorted() {
        let store = MemoryCredentialStore::with_sessions(["b", "a"]);
        assert_eq!(store.list().await.unwrap(), vec!["a", "b"]);
    }
}
