//! Session lifecycle manager
//!
//! This module provides the SessionManager that creates and reconnects
//! sessions, runs one event pump per client handle, and routes closures to the
//! reconnect scheduler and pairing challenges to the challenge bridge.

use crate::challenge::ChallengeBridge;
use crate::reconnect::{ClosureClass, ReconnectPolicy, ReconnectScheduler};
use crate::registry::SessionRegistry;
use crate::session::{Session, SharedSession};
use crate::{CreationError, SessionError};
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, info, warn};
use wagate_client::{
    ClientEvent, ClientHandle, ClosureCause, Connection, Connector, EventReceiver, MessagePayload,
    SendReceipt,
};
use wagate_storage::CredentialStore;

/// Manager settings
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Reconnect backoff and terminal codes
    pub reconnect: ReconnectPolicy,
    /// Log a terminal QR code for every pairing challenge
    pub print_terminal_qr: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            print_terminal_qr: true,
        }
    }
}

/// Creates, recovers and terminates sessions.
///
/// Cloning is cheap; every clone drives the same registry.
#[derive(Debug, Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

#[derive(Debug)]
struct ManagerInner {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn CredentialStore>,
    connector: Arc<dyn Connector>,
    scheduler: ReconnectScheduler,
    challenges: ChallengeBridge,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<dyn CredentialStore>,
        connector: Arc<dyn Connector>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry,
                store,
                connector,
                scheduler: ReconnectScheduler::new(config.reconnect),
                challenges: ChallengeBridge::new(config.print_terminal_qr),
            }),
        }
    }

    /// Registry this manager mutates
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    /// Credential store in use
    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.inner.store
    }

    /// Reconnect policy in effect
    pub fn policy(&self) -> &ReconnectPolicy {
        self.inner.scheduler.policy()
    }

    /// Look up a session
    pub fn get(&self, session_id: &str) -> Option<SharedSession> {
        self.inner.registry.get(session_id)
    }

    /// Bring up a client handle for `session_id`, creating the record if needed.
    ///
    /// An existing record keeps its identity, attempts and last closure; its
    /// previous handle is terminated in the background. A reconnect attempt
    /// for a session that is no longer registered returns
    /// [`SessionError::NotFound`] and changes nothing.
    pub async fn create_or_reconnect(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        is_reconnect_attempt: bool,
    ) -> Result<SharedSession, SessionError> {
        let registry = &self.inner.registry;
        if is_reconnect_attempt && !registry.contains(session_id) {
            debug!("Skipping reconnect of removed session {}", session_id);
            return Err(SessionError::NotFound(session_id.to_string()));
        }

        let connection = self.open_connection(session_id).await?;

        let session = if is_reconnect_attempt {
            match registry.get(session_id) {
                Some(session) => session,
                None => {
                    // removed while we were connecting
                    connection.handle.terminate().await;
                    return Err(SessionError::NotFound(session_id.to_string()));
                }
            }
        } else {
            registry.insert_if_absent(Session::new(session_id, self.inner.store.clone()))
        };

        if !is_reconnect_attempt && session.cancel_retry() {
            debug!("Cancelled pending reconnect of session {}", session_id);
        }
        if let Some(user_id) = user_id {
            registry.bind_user(user_id, session_id);
        }
        self.attach(&session, connection, is_reconnect_attempt);
        Ok(session)
    }

    /// Create `session_id` unless it, or a session bound to `user_id`, already
    /// exists. Returns the session and whether it already existed.
    ///
    /// The record and the user binding are reserved in the registry before
    /// the connector is awaited, so concurrent callers racing for the same id
    /// or user observe the winner's record and never open a second
    /// connection. A failed connect releases the reservation.
    pub async fn create_if_absent(
        &self,
        session_id: &str,
        user_id: Option<&str>,
    ) -> Result<(SharedSession, bool), SessionError> {
        let registry = &self.inner.registry;
        if let Some(existing) = user_id.and_then(|u| registry.session_for_user(u)) {
            return Ok((existing, true));
        }

        let candidate = Session::new(session_id, self.inner.store.clone());
        let session = registry.insert_if_absent(candidate.clone());
        if !Arc::ptr_eq(&session, &candidate) {
            if let Some(user_id) = user_id {
                registry.bind_user(user_id, session_id);
            }
            return Ok((session, true));
        }

        if let Some(user_id) = user_id {
            if let Err(owner) = registry.claim_user(user_id, &session) {
                registry.remove_if_same(&session);
                debug!(
                    "User {} was claimed by session {} while creating {}",
                    user_id,
                    owner.id(),
                    session_id
                );
                return Ok((owner, true));
            }
        }

        let connection = match self.open_connection(session_id).await {
            Ok(connection) => connection,
            Err(e) => {
                registry.remove_if_same(&session);
                return Err(e);
            }
        };
        if session.is_removed() {
            connection.handle.terminate().await;
            return Err(SessionError::NotFound(session_id.to_string()));
        }

        self.attach(&session, connection, false);
        Ok((session, false))
    }

    async fn open_connection(&self, session_id: &str) -> Result<Connection, SessionError> {
        let credentials = self
            .inner
            .store
            .load(session_id)
            .await
            .map_err(|e| SessionError::creation(session_id, e))?;
        debug!(
            "Connecting session {} (registered: {})",
            session_id, credentials.registered
        );

        self.inner
            .connector
            .connect(session_id, credentials)
            .await
            .map_err(|e| SessionError::creation(session_id, CreationError::Connect(e)))
    }

    /// Install the connection's handle and start its event pump
    fn attach(&self, session: &SharedSession, connection: Connection, is_reconnect_attempt: bool) {
        let (generation, previous) = session.install_handle(connection.handle);
        if let Some(previous) = previous {
            tokio::spawn(async move { previous.terminate().await });
        }

        info!(
            "Session {} connecting (generation {}, reconnect: {})",
            session.id(),
            generation,
            is_reconnect_attempt
        );

        tokio::spawn(pump_events(
            self.clone(),
            session.clone(),
            generation,
            connection.events,
        ));
    }

    /// Reconnect entry point for the scheduler.
    ///
    /// Returns a boxed future so the retry loop can await the manager without
    /// making the manager's own future type recursive.
    pub(crate) fn reconnect_boxed(
        &self,
        session_id: String,
        user_id: Option<String>,
    ) -> BoxFuture<'static, Result<SharedSession, SessionError>> {
        let manager = self.clone();
        Box::pin(async move {
            manager
                .create_or_reconnect(&session_id, user_id.as_deref(), true)
                .await
        })
    }

    /// Remove a session, cancel its reconnect timer and close its handle.
    ///
    /// With `purge_credentials` the persisted credentials are deleted too.
    pub async fn terminate(
        &self,
        session_id: &str,
        purge_credentials: bool,
    ) -> Result<(), SessionError> {
        let session = self
            .inner
            .registry
            .remove(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        if let Some(handle) = session.retire() {
            handle.terminate().await;
        }

        if purge_credentials {
            if let Err(e) = self.inner.store.remove(session_id).await {
                warn!("Failed to purge credentials of session {}: {}", session_id, e);
            }
        }

        info!(
            "Session {} terminated (credentials purged: {})",
            session_id, purge_credentials
        );
        Ok(())
    }

    /// Send one message through the session's current handle. Never retried.
    pub async fn send(
        &self,
        session_id: &str,
        address: &str,
        payload: MessagePayload,
    ) -> Result<SendReceipt, SessionError> {
        let session = self
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let handle: Arc<dyn ClientHandle> = session
            .handle()
            .ok_or_else(|| SessionError::NotConnected(session_id.to_string()))?;

        let receipt = handle
            .send(address, payload)
            .await
            .map_err(|source| SessionError::Send {
                session_id: session_id.to_string(),
                source,
            })?;
        debug!(
            "Sent message {} through session {}",
            receipt.message_id, session_id
        );
        Ok(receipt)
    }

    /// Close every handle without touching persisted credentials
    pub async fn shutdown(&self) {
        let sessions = self.inner.registry.sessions();
        info!("Shutting down {} sessions", sessions.len());

        for session in sessions {
            if let Some(removed) = self.inner.registry.remove(session.id()) {
                if let Some(handle) = removed.retire() {
                    handle.terminate().await;
                }
            }
        }
    }

    async fn handle_event(&self, session: &SharedSession, generation: u64, event: ClientEvent) {
        let session_id = session.id();
        match event {
            ClientEvent::ChallengeIssued { payload } => {
                if session.apply_challenge(generation, &payload) {
                    info!("Session {} awaiting pairing", session_id);
                    self.inner.challenges.dispatch(session.clone(), payload);
                }
            }
            ClientEvent::Opened => {
                if session.apply_open(generation) {
                    info!("Session {} open", session_id);
                }
            }
            ClientEvent::Closed { cause } => self.handle_closure(session, generation, cause),
            ClientEvent::CredentialsRotated { credentials } => {
                // awaited in the pump so saves land in rotation order
                match session.saver().save(&credentials).await {
                    Ok(()) => debug!("Persisted rotated credentials of session {}", session_id),
                    Err(e) => warn!(
                        "Failed to persist credentials of session {}: {}",
                        session_id, e
                    ),
                }
            }
        }
    }

    fn handle_closure(&self, session: &SharedSession, generation: u64, cause: ClosureCause) {
        let Some(record) = session.apply_closed(generation, &cause) else {
            return;
        };

        match self.policy().classify(record.code) {
            ClosureClass::Terminal => {
                warn!(
                    "Session {} closed permanently (code {:?}): {}",
                    session.id(),
                    record.code,
                    record.reason
                );
            }
            ClosureClass::Retryable => {
                info!(
                    "Session {} closed (code {:?}): {}",
                    session.id(),
                    record.code,
                    record.reason
                );
                self.inner.scheduler.schedule(self, session);
            }
        }
    }
}

/// Drive one handle's event stream until it ends, the handle is superseded or
/// the session is removed.
async fn pump_events(
    manager: SessionManager,
    session: SharedSession,
    generation: u64,
    mut events: EventReceiver,
) {
    let mut saw_closure = false;

    loop {
        let event = tokio::select! {
            _ = session.lifetime().cancelled() => return,
            event = events.recv() => event,
        };

        let Some(event) = event else { break };
        if !session.is_current(generation) {
            debug!(
                "Ignoring {} from superseded handle of session {}",
                event.kind(),
                session.id()
            );
            continue;
        }
        if matches!(event, ClientEvent::Closed { .. }) {
            saw_closure = true;
        }
        manager.handle_event(&session, generation, event).await;
    }

    if !saw_closure && session.is_current(generation) {
        debug!("Event stream of session {} ended without closure", session.id());
        manager.handle_closure(
            &session,
            generation,
            ClosureCause::without_code("event stream ended"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use wagate_client::memory::MemoryConnector;
    use wagate_client::SendError;
    use wagate_storage::{CredentialState, MemoryCredentialStore, StorageError};

    /// Store that takes a while to save the first key version
    #[derive(Debug, Default)]
    struct SlowFirstSave {
        inner: MemoryCredentialStore,
    }

    #[async_trait]
    impl CredentialStore for SlowFirstSave {
        async fn load(&self, session_id: &str) -> Result<CredentialState, StorageError> {
            self.inner.load(session_id).await
        }

        async fn save(&self, session_id: &str, state: &CredentialState) -> Result<(), StorageError> {
            if state.material.get("v") == Some(&json!(1)) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.inner.save(session_id, state).await
        }

        async fn list(&self) -> Result<Vec<String>, StorageError> {
            self.inner.list().await
        }

        async fn remove(&self, session_id: &str) -> Result<(), StorageError> {
            self.inner.remove(session_id).await
        }
    }

    fn key_version(version: u64) -> CredentialState {
        let mut credentials = CredentialState::fresh();
        credentials.registered = true;
        credentials.material.insert("v".to_string(), json!(version));
        credentials
    }

    struct Harness {
        manager: SessionManager,
        connector: Arc<MemoryConnector>,
        store: Arc<MemoryCredentialStore>,
    }

    fn harness() -> Harness {
        let connector = Arc::new(MemoryConnector::new());
        let store = Arc::new(MemoryCredentialStore::new());
        let manager = SessionManager::new(
            Arc::new(SessionRegistry::new()),
            store.clone(),
            connector.clone(),
            ManagerConfig {
                print_terminal_qr: false,
                ..ManagerConfig::default()
            },
        );
        Harness {
            manager,
            connector,
            store,
        }
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_create_registers_connecting_session() {
        let h = harness();
        let session = h
            .manager
            .create_or_reconnect("s1", Some("u1"), false)
            .await
            .unwrap();

        assert_eq!(session.status(), SessionStatus::Connecting);
        assert_eq!(session.reconnect_attempts(), 0);
        assert_eq!(session.user_id().as_deref(), Some("u1"));
        assert!(h.manager.registry().contains("s1"));
        assert_eq!(h.connector.connect_count("s1"), 1);
        assert!(h.store.get("s1").is_some());
    }

    #[tokio::test]
    async fn test_reconnect_attempt_for_removed_session_is_noop() {
        let h = harness();
        let result = h.manager.create_or_reconnect("ghost", None, true).await;
        assert!(matches!(result, Err(SessionError::NotFound(_))));
        assert_eq!(h.connector.total_connects(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces_creation_error() {
        let h = harness();
        h.connector.fail_next_connects("s1", 1);
        let result = h.manager.create_or_reconnect("s1", None, false).await;
        assert!(matches!(
            result,
            Err(SessionError::Creation {
                source: CreationError::Connect(_),
                ..
            })
        ));
        assert!(!h.manager.registry().contains("s1"));
    }

    #[tokio::test]
    async fn test_reconnect_replaces_handle_and_terminates_previous() {
        let h = harness();
        let first = h.manager.create_or_reconnect("s1", None, false).await.unwrap();
        let old = h.connector.latest("s1").unwrap();
        old.open();
        settle().await;
        assert_eq!(first.status(), SessionStatus::Open);

        let second = h.manager.create_or_reconnect("s1", None, false).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.status(), SessionStatus::Connecting);
        settle().await;
        assert!(old.is_terminated());

        // the old handle's closure must not touch the record
        assert_eq!(second.status(), SessionStatus::Connecting);
        assert!(second.last_closure().is_none());
        assert!(second.next_retry().is_none());
    }

    #[tokio::test]
    async fn test_rotated_credentials_are_persisted() {
        let h = harness();
        h.manager.create_or_reconnect("s1", None, false).await.unwrap();
        let remote = h.connector.latest("s1").unwrap();

        let mut rotated = CredentialState::fresh();
        rotated.registered = true;
        remote.rotate(rotated.clone());

        for _ in 0..50 {
            if h.store.get("s1") == Some(rotated.clone()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.store.get("s1"), Some(rotated));
    }

    #[tokio::test]
    async fn test_rotations_are_persisted_in_order() {
        let connector = Arc::new(MemoryConnector::new());
        let store = Arc::new(SlowFirstSave::default());
        let manager = SessionManager::new(
            Arc::new(SessionRegistry::new()),
            store.clone(),
            connector.clone(),
            ManagerConfig {
                print_terminal_qr: false,
                ..ManagerConfig::default()
            },
        );
        manager.create_or_reconnect("s1", None, false).await.unwrap();
        let remote = connector.latest("s1").unwrap();

        remote.rotate(key_version(1));
        remote.rotate(key_version(2));

        for _ in 0..100 {
            if store.inner.get("s1") == Some(key_version(2)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // give a late save of the older version the chance to land
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.inner.get("s1"), Some(key_version(2)));
    }

    #[tokio::test]
    async fn test_send_paths() {
        let h = harness();
        assert!(matches!(
            h.manager
                .send("nope", "1@s.whatsapp.net", MessagePayload::text("hi"))
                .await,
            Err(SessionError::NotFound(_))
        ));

        h.manager.create_or_reconnect("s1", None, false).await.unwrap();
        assert!(matches!(
            h.manager
                .send("s1", "1@s.whatsapp.net", MessagePayload::text("hi"))
                .await,
            Err(SessionError::Send {
                source: SendError::NotOpen,
                ..
            })
        ));

        h.connector.latest("s1").unwrap().open();
        let receipt = h
            .manager
            .send("s1", "1@s.whatsapp.net", MessagePayload::text("hi"))
            .await
            .unwrap();
        assert!(!receipt.message_id.is_empty());
        assert_eq!(h.connector.latest("s1").unwrap().sent().len(), 1);
    }

    #[tokio::test]
    async fn test_terminate_removes_and_optionally_purges() {
        let h = harness();
        h.manager.create_or_reconnect("keep", Some("u1"), false).await.unwrap();
        h.manager.create_or_reconnect("purge", None, false).await.unwrap();

        h.manager.terminate("keep", false).await.unwrap();
        h.manager.terminate("purge", true).await.unwrap();

        assert!(h.manager.registry().is_empty());
        assert!(h.manager.registry().session_for_user("u1").is_none());
        assert!(h.store.get("keep").is_some());
        assert!(h.store.get("purge").is_none());
        assert!(h.connector.latest("keep").unwrap().is_terminated());
        assert!(matches!(
            h.manager.terminate("keep", false).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything_but_keeps_credentials() {
        let h = harness();
        for id in ["a", "b"] {
            h.manager.create_or_reconnect(id, None, false).await.unwrap();
        }
        h.manager.shutdown().await;

        assert!(h.manager.registry().is_empty());
        for id in ["a", "b"] {
            assert!(h.connector.latest(id).unwrap().is_terminated());
            assert!(h.store.get(id).is_some());
        }
    }

    #[tokio::test]
    async fn test_stream_end_without_closure_counts_as_retryable() {
        let h = harness();
        let session = h.manager.create_or_reconnect("s1", None, false).await.unwrap();
        h.connector.latest("s1").unwrap().end_stream();
        settle().await;

        assert_eq!(session.status(), SessionStatus::Closed);
        assert_eq!(session.reconnect_attempts(), 1);
        assert_eq!(session.last_closure().unwrap().code, None);
        assert!(session.next_retry().is_some());
    }
}
