//! Session lifecycle management for wagate.
//!
//! This crate owns every long-lived connection the gateway keeps to the
//! messaging network on behalf of its users. It translates each connection's
//! asynchronous event stream into a small set of observable states and keeps
//! connections alive across transient failures.
//!
//! ## Features
//!
//! - **Session Registry**: one injected instance mapping session ids and user ids to shared records
//! - **Lifecycle Manager**: create-or-reconnect, per-handle event pumps, stale handle guarding
//! - **Reconnect Scheduler**: terminal vs retryable closures, capped exponential backoff, unbounded retries
//! - **Challenge Bridge**: terminal and PNG renderings of pairing QR codes off the async runtime
//! - **Startup Loader**: reconnects every persisted session at boot
//! - **Control Service**: typed request/response surface for the HTTP layer
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wagate_client::memory::MemoryConnector;
//! use wagate_session::{ManagerConfig, SessionManager, SessionRegistry, StartupLoader};
//! use wagate_storage::MemoryCredentialStore;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let manager = SessionManager::new(
//!     Arc::new(SessionRegistry::new()),
//!     Arc::new(MemoryCredentialStore::new()),
//!     Arc::new(MemoryConnector::new()),
//!     ManagerConfig::default(),
//! );
//!
//! let report = StartupLoader::new(manager.clone()).run().await?;
//! println!("restored {} sessions", report.started);
//!
//! let session = manager.create_or_reconnect("s1", Some("user-1"), false).await?;
//! println!("{} is {}", session.id(), session.status());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod challenge;
pub mod control;
pub mod loader;
pub mod manager;
pub mod reconnect;
pub mod registry;
pub mod session;

use thiserror::Error;
use wagate_client::{ConnectError, SendError};
use wagate_storage::StorageError;

// Re-export main types
pub use challenge::{ChallengeBridge, ChallengeError};
pub use control::{ControlError, ControlService};
pub use loader::{LoadReport, StartupLoader};
pub use manager::{ManagerConfig, SessionManager};
pub use reconnect::{ClosureClass, ReconnectPolicy, ReconnectScheduler};
pub use registry::SessionRegistry;
pub use session::{
    ClosureRecord, CredentialSaver, RetryPlan, Session, SessionSnapshot, SessionStatus,
    SessionSummary, SharedSession,
};

/// Failure to bring up a client connection
#[derive(Error, Debug)]
pub enum CreationError {
    /// Credentials could not be loaded or initialized
    #[error("credential store: {0}")]
    Storage(#[from] StorageError),
    /// Connector could not establish a connection
    #[error("connector: {0}")]
    Connect(#[from] ConnectError),
}

/// Session management errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Creating or reconnecting a session failed
    #[error("failed to create session {session_id}: {source}")]
    Creation {
        /// Session being created
        session_id: String,
        /// Underlying failure
        #[source]
        source: CreationError,
    },
    /// No session with this id is registered
    #[error("session not found: {0}")]
    NotFound(String),
    /// Session exists but has no live client handle
    #[error("session {0} is not connected")]
    NotConnected(String),
    /// Client refused or failed to send
    #[error("send through session {session_id} failed: {source}")]
    Send {
        /// Session used for sending
        session_id: String,
        /// Underlying failure
        #[source]
        source: SendError,
    },
}

impl SessionError {
    pub(crate) fn creation(session_id: &str, source: impl Into<CreationError>) -> Self {
        SessionError::Creation {
            session_id: session_id.to_string(),
            source: source.into(),
        }
    }
}
