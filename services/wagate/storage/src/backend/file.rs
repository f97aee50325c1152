//! File-based credential store: one directory per session

use crate::{validate_session_id, CredentialState, CredentialStore, StorageError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

const SESSIONS_DIR: &str = "sessions";
const CREDS_FILE: &str = "creds.json";

/// File-based credential store.
///
/// Layout: `<data_dir>/sessions/<session_id>/creds.json`.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    data_dir: PathBuf,
}

impl FileCredentialStore {
    /// Open (and create if needed) a store rooted at `data_dir`
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(data_dir.join(SESSIONS_DIR)).await?;
        info!("File credential store at {:?}", data_dir);
        Ok(Self { data_dir })
    }

    /// Root data directory
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.data_dir.join(SESSIONS_DIR).join(session_id)
    }

    fn creds_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(CREDS_FILE)
    }

    async fn write_record(&self, session_id: &str, state: &CredentialState) -> Result<(), StorageError> {
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir).await?;

        // write-then-rename so a crash never leaves a truncated record
        let tmp = dir.join(format!("{CREDS_FILE}.tmp"));
        let content = serde_json::to_vec_pretty(state)?;
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, dir.join(CREDS_FILE)).await?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self, session_id: &str) -> Result<CredentialState, StorageError> {
        validate_session_id(session_id)?;
        let path = self.creds_path(session_id);

        match fs::read(&path).await {
            Ok(content) => serde_json::from_slice(&content).map_err(|e| {
                StorageError::Corruption(format!(
                    "Invalid credentials file for session {}: {}",
                    session_id, e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No credentials for session {}, initializing", session_id);
                let state = CredentialState::fresh();
                self.write_record(session_id, &state).await?;
                Ok(state)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, session_id: &str, state: &CredentialState) -> Result<(), StorageError> {
        validate_session_id(session_id)?;
        debug!("FileStore save session={} registered={}", session_id, state.registered);
        self.write_record(session_id, state).await
    }

    async fn list(&self) -> Result<Vec<String>, StorageError> {
        let sessions_dir = self.data_dir.join(SESSIONS_DIR);
        let mut ids = Vec::new();

        let mut entries = match fs::read_dir(&sessions_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                warn!("Skipping non UTF-8 session directory {:?}", entry.path());
                continue;
            };
            if validate_session_id(&name).is_err() {
                warn!("Skipping session directory with invalid id {:?}", name);
                continue;
            }
            if fs::try_exists(entry.path().join(CREDS_FILE)).await? {
                ids.push(name);
            }
        }

        ids.sort();
        Ok(ids)
    }

    async fn remove(&self, session_id: &str) -> Result<(), StorageError> {
        validate_session_id(session_id)?;
        match fs::remove_dir_all(self.session_dir(session_id)).await {
            Ok(()) => {
                info!("Removed persisted credentials for session {}", session_id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_initializes_and_persists() {
        let dir = TempDir::new().unwrap();
        let store = FileCredentialStore::open(dir.path()).await.unwrap();

        let state = store.load("alpha").await.unwrap();
        assert_eq!(state, CredentialState::fresh());
        assert!(dir.path().join("sessions/alpha/creds.json").exists());
        assert_eq!(store.list().await.unwrap(), vec!["alpha".to_string()]);
    }

    #[tokio::test]
    async fn test_rotation_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let mut state = CredentialState::fresh();
        state.registered = true;
        state
            .material
            .insert("noiseKey".to_string(), serde_json::json!({"public": "abc"}));

        {
            let store = FileCredentialStore::open(dir.path()).await.unwrap();
            store.save("alpha", &state).await.unwrap();
        }

        let reopened = FileCredentialStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.load("alpha").await.unwrap(), state);
    }

    #[tokio::test]
    async fn test_list_ignores_stray_entries() {
        let dir = TempDir::new().unwrap();
        let store = FileCredentialStore::open(dir.path()).await.unwrap();
        store.load("b").await.unwrap();
        store.load("a").await.unwrap();

        // a directory without a credentials file and a plain file
        std::fs::create_dir_all(dir.path().join("sessions/empty")).unwrap();
        std::fs::write(dir.path().join("sessions/notes.txt"), b"x").unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = FileCredentialStore::open(dir.path()).await.unwrap();
        std::fs::create_dir_all(dir.path().join("sessions/bad")).unwrap();
        std::fs::write(dir.path().join("sessions/bad/creds.json"), b"{not json").unwrap();

        assert!(matches!(
            store.load("bad").await,
            Err(StorageError::Corruption(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_and_invalid_ids() {
        let dir = TempDir::new().unwrap();
        let store = FileCredentialStore::open(dir.path()).await.unwrap();
        store.load("gone").await.unwrap();
        store.remove("gone").await.unwrap();
        store.remove("gone").await.unwrap();
        assert!(store.list().await.unwrap().is_empty());

        assert!(matches!(
            store.load("../escape").await,
            Err(StorageError::InvalidId(_))
        ));
    }
}
