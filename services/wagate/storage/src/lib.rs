//! Credential persistence for wagate sessions.
//!
//! Every session owns one durable record keyed by its identity. The record only
//! holds key material handed out by the messaging client; runtime state such as
//! status or reconnect counters is never written here.
//!
//! Backends are pluggable through [`CredentialStore`]: an in-memory store for
//! development and tests, and a directory-per-session file store.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub use backend::file::FileCredentialStore;
pub use backend::mem::MemoryCredentialStore;

/// Key material for one session.
///
/// The gateway treats the contents as opaque; only the messaging client reads
/// or rotates them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialState {
    /// Whether the account has completed pairing with the network
    #[serde(default)]
    pub registered: bool,
    /// Opaque key material owned by the messaging client
    #[serde(default)]
    pub material: serde_json::Map<String, serde_json::Value>,
}

impl CredentialState {
    /// Fresh, unpaired credentials
    pub fn fresh() -> Self {
        Self::default()
    }
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Stored record could not be decoded
    #[error("Data corruption: {0}")]
    Corruption(String),
    /// Session identity cannot be used as a storage key
    #[error("Invalid session id: {0:?}")]
    InvalidId(String),
    /// Unknown backend name
    #[error("Invalid storage mode {0:?}, expected 'memory' or 'file'")]
    InvalidMode(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable per-session credential storage
#[async_trait]
pub trait CredentialStore: Send + Sync + fmt::Debug {
    /// Load credentials for a session, creating and persisting fresh ones if none exist
    async fn load(&self, session_id: &str) -> Result<CredentialState, StorageError>;

    /// Persist rotated credentials for a session
    async fn save(&self, session_id: &str, state: &CredentialState) -> Result<(), StorageError>;

    /// Enumerate every persisted session identity
    async fn list(&self) -> Result<Vec<String>, StorageError>;

    /// Delete the persisted record of a session (no-op when absent)
    async fn remove(&self, session_id: &str) -> Result<(), StorageError>;
}

/// Credential store backend configuration
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum StorageMode {
    /// In-memory storage (dev/tests only, lost on restart)
    #[default]
    InMemory,
    /// One directory per session under `data_dir`
    File {
        /// Data directory path
        data_dir: PathBuf,
    },
}

impl StorageMode {
    /// Parse the textual mode used by config files and CLI flags
    pub fn parse(mode: &str, data_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        match mode {
            "memory" => Ok(StorageMode::InMemory),
            "file" => Ok(StorageMode::File {
                data_dir: data_dir.into(),
            }),
            other => Err(StorageError::InvalidMode(other.to_string())),
        }
    }
}

/// Open a credential store for the given mode
pub async fn open_store(mode: StorageMode) -> Result<Arc<dyn CredentialStore>, StorageError> {
    match mode {
        StorageMode::InMemory => Ok(Arc::new(MemoryCredentialStore::new())),
        StorageMode::File { data_dir } => Ok(Arc::new(FileCredentialStore::open(data_dir).await?)),
    }
}

/// Check that a session id can safely be used as a storage key.
///
/// Ids become directory names in the file backend, so path separators,
/// traversal components and control characters are rejected.
pub fn validate_session_id(session_id: &str) -> Result<(), StorageError> {
    let invalid = session_id.is_empty()
        || session_id == "."
        || session_id == ".."
        || session_id.len() > 128
        || session_id
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control());
    if invalid {
        return Err(StorageError::InvalidId(session_id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_session_id() {
        assert!(validate_session_id("s_1700000000000_ab12cd").is_ok());
        assert!(validate_session_id("user-42").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("..").is_err());
        assert!(validate_session_id("a/b").is_err());
        assert!(validate_session_id("a\\b").is_err());
        assert!(validate_session_id("a\nb").is_err());
    }

    #[test]
    fn test_storage_mode_parse() {
        assert_eq!(StorageMode::parse("memory", "./x").unwrap(), StorageMode::InMemory);
        assert_eq!(
            StorageMode::parse("file", "./x").unwrap(),
            StorageMode::File {
                data_dir: PathBuf::from("./x")
            }
        );
        assert!(StorageMode::parse("redis", "./x").is_err());
    }

    #[test]
    fn test_credential_state_tolerates_missing_fields() {
        let state: CredentialState = serde_json::from_str("{}").unwrap();
        assert_eq!(state, CredentialState::fresh());
    }
}
