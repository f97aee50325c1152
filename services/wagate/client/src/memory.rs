//! In-process messaging client for development and testing.
//!
//! [`MemoryConnector`] hands out [`MemoryConnection`]s whose lifecycle events
//! are injected by the caller (tests) or by an automatic pairing script
//! (local runs without a real network).

use crate::{
    ClientEvent, ClientHandle, ClosureCause, ConnectError, Connection, Connector, EventSender,
    MessagePayload, SendError, SendReceipt,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use wagate_storage::CredentialState;

/// Scriptable in-memory connector
#[derive(Debug, Default)]
pub struct MemoryConnector {
    state: Mutex<ConnectorState>,
    /// When set, every connection pairs and opens by itself
    auto_pair: Option<Duration>,
}

#[derive(Debug, Default)]
struct ConnectorState {
    /// Every connection ever handed out, in order
    connections: Vec<MemoryConnection>,
    /// Remaining simulated connect failures per session
    pending_failures: HashMap<String, u32>,
}

impl MemoryConnector {
    /// Connector whose connections only move when the caller injects events
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector that plays a pairing flow on its own.
    ///
    /// Unregistered credentials get a challenge after `step`, then a credential
    /// rotation and an open after two more steps. Registered credentials open
    /// after one step.
    pub fn with_auto_pair(step: Duration) -> Self {
        Self {
            state: Mutex::default(),
            auto_pair: Some(step),
        }
    }

    /// Make the next `count` connect attempts for `session_id` fail
    pub fn fail_next_connects(&self, session_id: &str, count: u32) {
        self.state
            .lock()
            .pending_failures
            .insert(session_id.to_string(), count);
    }

    /// All connections handed out for a session, oldest first
    pub fn connections(&self, session_id: &str) -> Vec<MemoryConnection> {
        self.state
            .lock()
            .connections
            .iter()
            .filter(|c| c.session_id() == session_id)
            .cloned()
            .collect()
    }

    /// Number of successful connects for a session
    pub fn connect_count(&self, session_id: &str) -> usize {
        self.connections(session_id).len()
    }

    /// Most recent connection for a session
    pub fn latest(&self, session_id: &str) -> Option<MemoryConnection> {
        self.connections(session_id).pop()
    }

    /// Number of successful connects across all sessions
    pub fn total_connects(&self) -> usize {
        self.state.lock().connections.len()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        session_id: &str,
        credentials: CredentialState,
    ) -> Result<Connection, ConnectError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = {
            let mut state = self.state.lock();
            if let Some(remaining) = state.pending_failures.get_mut(session_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ConnectError::Transport(format!(
                        "simulated connect failure for {session_id}"
                    )));
                }
            }
            let connection = MemoryConnection::new(session_id, credentials, tx);
            state.connections.push(connection.clone());
            connection
        };

        debug!("MemoryConnector connected session={}", session_id);
        if let Some(step) = self.auto_pair {
            connection.spawn_auto_pair(step);
        }

        Ok(Connection {
            handle: Arc::new(MemoryClientHandle {
                inner: connection.inner.clone(),
            }),
            events: rx,
        })
    }
}

/// Test-side view of one in-memory connection
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    inner: Arc<ConnectionInner>,
}

#[derive(Debug)]
struct ConnectionInner {
    session_id: String,
    credentials: CredentialState,
    events: Mutex<Option<EventSender>>,
    open: AtomicBool,
    terminated: AtomicBool,
    sent: Mutex<Vec<(String, MessagePayload)>>,
    next_message_id: AtomicU64,
}

impl ConnectionInner {
    fn emit(&self, event: ClientEvent) -> bool {
        match self.events.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

impl MemoryConnection {
    fn new(session_id: &str, credentials: CredentialState, events: EventSender) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                session_id: session_id.to_string(),
                credentials,
                events: Mutex::new(Some(events)),
                open: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
                next_message_id: AtomicU64::new(1),
            }),
        }
    }

    /// Session this connection was made for
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Credentials the connection was created with
    pub fn credentials(&self) -> &CredentialState {
        &self.inner.credentials
    }

    /// Emit a pairing challenge
    pub fn issue_challenge(&self, payload: impl Into<String>) -> bool {
        self.inner.emit(ClientEvent::ChallengeIssued {
            payload: payload.into(),
        })
    }

    /// Mark the connection open and emit `Opened`
    pub fn open(&self) -> bool {
        self.inner.open.store(true, Ordering::SeqCst);
        self.inner.emit(ClientEvent::Opened)
    }

    /// Mark the connection closed and emit `Closed`
    pub fn close(&self, cause: ClosureCause) -> bool {
        self.inner.open.store(false, Ordering::SeqCst);
        self.inner.emit(ClientEvent::Closed { cause })
    }

    /// Close with an untyped diagnostic payload, decoded the way a real
    /// client library's disconnect error would be
    pub fn close_with_diagnostic(&self, raw: &serde_json::Value) -> bool {
        self.close(ClosureCause::decode(raw))
    }

    /// Close with a status code, reported in the boom shape
    pub fn close_with_code(&self, code: u16) -> bool {
        self.close_with_diagnostic(&serde_json::json!({
            "message": format!("closed with status {code}"),
            "output": {"statusCode": code},
        }))
    }

    /// Emit a credential rotation
    pub fn rotate(&self, credentials: CredentialState) -> bool {
        self.inner
            .emit(ClientEvent::CredentialsRotated { credentials })
    }

    /// Drop the event sender without emitting a closure
    pub fn end_stream(&self) {
        self.inner.open.store(false, Ordering::SeqCst);
        self.inner.events.lock().take();
    }

    /// Messages sent through this connection
    pub fn sent(&self) -> Vec<(String, MessagePayload)> {
        self.inner.sent.lock().clone()
    }

    /// Whether the gateway terminated this connection
    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    fn spawn_auto_pair(&self, step: Duration) {
        let connection = self.clone();
        tokio::spawn(async move {
            if !connection.credentials().registered {
                tokio::time::sleep(step).await;
                let payload = dev_challenge_payload();
                if !connection.issue_challenge(payload) {
                    return;
                }
                info!(
                    "Dev pairing for session {} completes in {:?}",
                    connection.session_id(),
                    step * 2
                );

                tokio::time::sleep(step).await;
                let mut credentials = connection.credentials().clone();
                credentials.registered = true;
                credentials.material.insert(
                    "device".to_string(),
                    serde_json::Value::String(format!("dev:{}", connection.session_id())),
                );
                if !connection.rotate(credentials) {
                    return;
                }
            }

            tokio::time::sleep(step).await;
            if !connection.is_terminated() {
                connection.open();
            }
        });
    }
}

/// Client handle backed by a [`MemoryConnection`]
#[derive(Debug)]
pub struct MemoryClientHandle {
    inner: Arc<ConnectionInner>,
}

#[async_trait]
impl ClientHandle for MemoryClientHandle {
    async fn send(&self, address: &str, payload: MessagePayload) -> Result<SendReceipt, SendError> {
        if self.inner.terminated.load(Ordering::SeqCst) || !self.inner.open.load(Ordering::SeqCst) {
            return Err(SendError::NotOpen);
        }
        if !address.contains('@') {
            return Err(SendError::InvalidAddress(address.to_string()));
        }

        let id = self.inner.next_message_id.fetch_add(1, Ordering::SeqCst);
        self.inner.sent.lock().push((address.to_string(), payload));
        Ok(SendReceipt {
            message_id: format!("MEM{id:016X}"),
        })
    }

    async fn terminate(&self) {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.open.store(false, Ordering::SeqCst);
        self.inner.emit(ClientEvent::Closed {
            cause: ClosureCause::without_code("terminated by gateway"),
        });
        self.inner.events.lock().take();
    }
}

fn dev_challenge_payload() -> String {
    let part = |len: usize| -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    };
    format!("2@{},{},{}", part(32), part(44), part(44))
}
