//! Lifecycle events emitted by a client connection

use crate::closure::ClosureCause;
use wagate_storage::CredentialState;

/// Events emitted by a connection, in order
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The network requires pairing; `payload` is the raw QR content
    ChallengeIssued {
        /// Raw challenge payload
        payload: String,
    },
    /// Connection is authenticated and usable
    Opened,
    /// Connection ended
    Closed {
        /// Why it ended, as far as the client could tell
        cause: ClosureCause,
    },
    /// Key material changed and must be persisted
    CredentialsRotated {
        /// Full credential state after rotation
        credentials: CredentialState,
    },
}

impl ClientEvent {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::ChallengeIssued { .. } => "challenge-issued",
            ClientEvent::Opened => "connection-opened",
            ClientEvent::Closed { .. } => "connection-closed",
            ClientEvent::CredentialsRotated { .. } => "credentials-rotated",
        }
    }
}
