//! Messaging network client boundary for wagate.
//!
//! The wire protocol and cryptographic handshake of the messaging network are
//! owned by an external client library. This crate only describes what the
//! gateway needs from it:
//!
//! - a [`Connector`] that turns stored credentials into a live connection,
//! - a [`ClientHandle`] to send through and terminate that connection,
//! - an ordered stream of [`ClientEvent`]s describing its lifecycle.
//!
//! [`memory::MemoryConnector`] is a scriptable in-process implementation used
//! by tests and local development runs.
//!
//! ## Example
//!
//! ```rust,no_run
//! use wagate_client::{ClientEvent, Connector, memory::MemoryConnector};
//! use wagate_storage::CredentialState;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let connector = MemoryConnector::new();
//! let mut connection = connector.connect("s1", CredentialState::fresh()).await?;
//!
//! while let Some(event) = connection.events.recv().await {
//!     match event {
//!         ClientEvent::ChallengeIssued { payload } => println!("scan {payload}"),
//!         ClientEvent::Opened => println!("connected"),
//!         ClientEvent::Closed { cause } => println!("closed: {}", cause.reason),
//!         ClientEvent::CredentialsRotated { .. } => println!("keys rotated"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod closure;
pub mod event;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use wagate_storage::CredentialState;

pub use closure::ClosureCause;
pub use event::ClientEvent;

/// Receiving side of a connection's lifecycle event stream
pub type EventReceiver = mpsc::UnboundedReceiver<ClientEvent>;

/// Sending side of a connection's lifecycle event stream
pub type EventSender = mpsc::UnboundedSender<ClientEvent>;

/// A freshly established connection: its handle plus its event stream
#[derive(Debug)]
pub struct Connection {
    /// Handle used to send through and terminate the connection
    pub handle: Arc<dyn ClientHandle>,
    /// Lifecycle events, in the order the client emitted them
    pub events: EventReceiver,
}

/// Payload of an outgoing message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum MessagePayload {
    /// Plain text message
    Text {
        /// Message body
        text: String,
    },
}

impl MessagePayload {
    /// Plain text payload
    pub fn text(text: impl Into<String>) -> Self {
        MessagePayload::Text { text: text.into() }
    }
}

/// Acknowledgement returned by the network for a sent message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Network-assigned message id
    pub message_id: String,
}

/// Failure to establish a connection
#[derive(Error, Debug)]
pub enum ConnectError {
    /// Transport-level failure (DNS, TCP, TLS, websocket)
    #[error("transport error: {0}")]
    Transport(String),
    /// Client library refused the credentials before connecting
    #[error("credentials rejected: {0}")]
    Rejected(String),
}

/// Failure to send a message through a connection
#[derive(Error, Debug)]
pub enum SendError {
    /// Connection is not open (not yet paired, closed or terminated)
    #[error("connection is not open")]
    NotOpen,
    /// Destination address is malformed
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// Network rejected the message
    #[error("rejected by network: {0}")]
    Rejected(String),
    /// Transport-level failure while sending
    #[error("transport error: {0}")]
    Transport(String),
}

/// Factory for connections to the messaging network.
///
/// Implementations turn the library's raw disconnect diagnostic into a
/// [`ClosureCause`] with [`ClosureCause::decode`] before emitting
/// [`ClientEvent::Closed`].
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Establish a new connection for `session_id` using `credentials`
    async fn connect(
        &self,
        session_id: &str,
        credentials: CredentialState,
    ) -> Result<Connection, ConnectError>;
}

/// Live connection to the messaging network
#[async_trait]
pub trait ClientHandle: Send + Sync + fmt::Debug {
    /// Send one message to `address`
    async fn send(&self, address: &str, payload: MessagePayload) -> Result<SendReceipt, SendError>;

    /// Close the connection. Best-effort; failures are swallowed by implementations.
    async fn terminate(&self);
}
