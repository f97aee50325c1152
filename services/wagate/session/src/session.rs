//! Per-session record shared by the registry, the event pumps and the reconnect scheduler.
//!
//! A [`Session`] is handed out as an `Arc` so every holder observes later
//! mutations. All mutable state sits behind one `parking_lot::RwLock`; each
//! transition is a single short critical section and no guard ever crosses an
//! `.await`.
//!
//! Every installed client handle bumps the session's `generation`. Event
//! transitions carry the generation of the handle that produced them and are
//! dropped when a newer handle has been installed since.

use crate::reconnect::ReconnectPolicy;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use wagate_client::{ClientHandle, ClosureCause};
use wagate_storage::{CredentialState, CredentialStore, StorageError};

/// Shared handle to a session record
pub type SharedSession = Arc<Session>;

/// Externally observable session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// A client handle is being brought up
    Connecting,
    /// The network wants the user to scan a pairing code
    AwaitingChallenge,
    /// Authenticated and usable
    Open,
    /// The last client handle closed
    Closed,
}

impl SessionStatus {
    /// Wire name of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::AwaitingChallenge => "awaiting_challenge",
            SessionStatus::Open => "open",
            SessionStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Most recent closure of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosureRecord {
    /// Status code reported by the client, if any
    pub code: Option<u16>,
    /// Human-readable reason
    pub reason: String,
    /// When the closure was observed
    pub at: DateTime<Utc>,
}

impl ClosureRecord {
    /// Record a closure cause observed now
    pub fn from_cause(cause: &ClosureCause) -> Self {
        Self {
            code: cause.code,
            reason: cause.reason.clone(),
            at: Utc::now(),
        }
    }
}

/// Current pairing challenge and its derived forms
#[derive(Debug, Clone, PartialEq)]
pub struct Challenge {
    /// Raw QR payload as issued by the network
    pub raw: String,
    /// Terminal rendering, once produced
    pub rendered: Option<String>,
    /// `data:image/png;base64,...` URL, once produced
    pub encoded: Option<String>,
    /// When the challenge was issued
    pub issued_at: DateTime<Utc>,
}

/// A scheduled reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPlan {
    /// Attempt number this timer belongs to (1-based)
    pub attempt: u32,
    /// Delay the timer was armed with
    pub delay: Duration,
    /// Instant at which the timer fires
    pub due_at: Instant,
}

impl RetryPlan {
    fn new(attempt: u32, delay: Duration) -> Self {
        Self {
            attempt,
            delay,
            due_at: Instant::now() + delay,
        }
    }

    /// Time left until the timer fires
    pub fn remaining(&self) -> Duration {
        self.due_at.saturating_duration_since(Instant::now())
    }
}

/// Capability to persist rotated credentials for one session
#[derive(Clone, Debug)]
pub struct CredentialSaver {
    session_id: String,
    store: Arc<dyn CredentialStore>,
}

impl CredentialSaver {
    /// Persist the given credentials under this saver's session id
    pub async fn save(&self, credentials: &CredentialState) -> Result<(), StorageError> {
        self.store.save(&self.session_id, credentials).await
    }
}

/// Compact listing entry; never exposes the client handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session id
    pub id: String,
    /// Current status
    pub status: SessionStatus,
    /// Bound external user, if any
    pub user_id: Option<String>,
    /// Reconnect attempts since the last open
    pub reconnect_attempts: u32,
}

/// Full diagnostic view of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Session id
    pub session_id: String,
    /// Current status
    pub status: SessionStatus,
    /// Bound external user, if any
    pub user_id: Option<String>,
    /// Reconnect attempts since the last open
    pub reconnect_attempts: u32,
    /// Most recent closure
    pub last_closure: Option<ClosureRecord>,
    /// Raw pairing payload while a challenge is pending
    pub qr: Option<String>,
    /// Encoded pairing image while a challenge is pending
    pub qr_image: Option<String>,
    /// Milliseconds until the scheduled reconnect fires
    pub next_retry_in_ms: Option<u64>,
    /// Creation time of the record
    pub created_at: DateTime<Utc>,
    /// Last mutation time of the record
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
struct SessionState {
    status: SessionStatus,
    generation: u64,
    handle: Option<Arc<dyn ClientHandle>>,
    challenge: Option<Challenge>,
    last_closure: Option<ClosureRecord>,
    reconnect_attempts: u32,
    next_retry: Option<RetryPlan>,
    retry_token: Option<CancellationToken>,
    user_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SessionState {
    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn cancel_retry(&mut self) -> bool {
        self.next_retry = None;
        match self.retry_token.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// One logical connection to the messaging network
#[derive(Debug)]
pub struct Session {
    id: String,
    saver: CredentialSaver,
    /// Cancelled when the session leaves the registry
    lifetime: CancellationToken,
    state: RwLock<SessionState>,
}

impl Session {
    /// New record in `Connecting` state with no handle installed yet
    pub fn new(id: impl Into<String>, store: Arc<dyn CredentialStore>) -> SharedSession {
        let id = id.into();
        let now = Utc::now();
        Arc::new(Self {
            saver: CredentialSaver {
                session_id: id.clone(),
                store,
            },
            id,
            lifetime: CancellationToken::new(),
            state: RwLock::new(SessionState {
                status: SessionStatus::Connecting,
                generation: 0,
                handle: None,
                challenge: None,
                last_closure: None,
                reconnect_attempts: 0,
                next_retry: None,
                retry_token: None,
                user_id: None,
                created_at: now,
                updated_at: now,
            }),
        })
    }

    /// Session id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current status
    pub fn status(&self) -> SessionStatus {
        self.state.read().status
    }

    /// Reconnect attempts since the last open
    pub fn reconnect_attempts(&self) -> u32 {
        self.state.read().reconnect_attempts
    }

    /// Bound external user
    pub fn user_id(&self) -> Option<String> {
        self.state.read().user_id.clone()
    }

    /// Most recent closure
    pub fn last_closure(&self) -> Option<ClosureRecord> {
        self.state.read().last_closure.clone()
    }

    /// Current pairing challenge
    pub fn challenge(&self) -> Option<Challenge> {
        self.state.read().challenge.clone()
    }

    /// Currently scheduled reconnect
    pub fn next_retry(&self) -> Option<RetryPlan> {
        self.state.read().next_retry
    }

    /// Generation of the installed handle
    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// Currently installed client handle
    pub fn handle(&self) -> Option<Arc<dyn ClientHandle>> {
        self.state.read().handle.clone()
    }

    /// Credential persistence capability for this session
    pub fn saver(&self) -> &CredentialSaver {
        &self.saver
    }

    /// Whether `generation` still identifies the installed handle
    pub fn is_current(&self, generation: u64) -> bool {
        !self.is_removed() && self.state.read().generation == generation
    }

    /// Whether the session has been removed from the registry
    pub fn is_removed(&self) -> bool {
        self.lifetime.is_cancelled()
    }

    pub(crate) fn lifetime(&self) -> &CancellationToken {
        &self.lifetime
    }

    /// Listing entry
    pub fn summary(&self) -> SessionSummary {
        let state = self.state.read();
        SessionSummary {
            id: self.id.clone(),
            status: state.status,
            user_id: state.user_id.clone(),
            reconnect_attempts: state.reconnect_attempts,
        }
    }

    /// Diagnostic view
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.read();
        SessionSnapshot {
            session_id: self.id.clone(),
            status: state.status,
            user_id: state.user_id.clone(),
            reconnect_attempts: state.reconnect_attempts,
            last_closure: state.last_closure.clone(),
            qr: state.challenge.as_ref().map(|c| c.raw.clone()),
            qr_image: state.challenge.as_ref().and_then(|c| c.encoded.clone()),
            next_retry_in_ms: state
                .next_retry
                .map(|plan| plan.remaining().as_millis() as u64),
            created_at: state.created_at,
            updated_at: state.updated_at,
        }
    }

    /// Install a new client handle, returning its generation and the superseded handle.
    ///
    /// Status goes back to `Connecting`; attempts and the last closure are kept.
    pub(crate) fn install_handle(
        &self,
        handle: Arc<dyn ClientHandle>,
    ) -> (u64, Option<Arc<dyn ClientHandle>>) {
        let mut state = self.state.write();
        state.generation += 1;
        state.status = SessionStatus::Connecting;
        state.challenge = None;
        let previous = state.handle.replace(handle);
        state.touch();
        (state.generation, previous)
    }

    /// Detach the handle so no pump can mutate the record any more
    pub(crate) fn retire(&self) -> Option<Arc<dyn ClientHandle>> {
        let mut state = self.state.write();
        state.generation += 1;
        state.status = SessionStatus::Closed;
        state.challenge = None;
        state.cancel_retry();
        state.touch();
        state.handle.take()
    }

    /// Replace the bound user, returning the previous one
    pub(crate) fn set_user(&self, user_id: Option<String>) -> Option<String> {
        let mut state = self.state.write();
        state.touch();
        std::mem::replace(&mut state.user_id, user_id)
    }

    /// Clear the bound user only if it is still `user_id`
    pub(crate) fn clear_user_if(&self, user_id: &str) {
        let mut state = self.state.write();
        if state.user_id.as_deref() == Some(user_id) {
            state.user_id = None;
            state.touch();
        }
    }

    pub(crate) fn apply_challenge(&self, generation: u64, payload: &str) -> bool {
        let mut state = self.state.write();
        if state.generation != generation {
            return false;
        }
        state.status = SessionStatus::AwaitingChallenge;
        state.challenge = Some(Challenge {
            raw: payload.to_string(),
            rendered: None,
            encoded: None,
            issued_at: Utc::now(),
        });
        state.touch();
        true
    }

    pub(crate) fn apply_open(&self, generation: u64) -> bool {
        let mut state = self.state.write();
        if state.generation != generation {
            return false;
        }
        state.status = SessionStatus::Open;
        state.reconnect_attempts = 0;
        state.cancel_retry();
        state.challenge = None;
        state.touch();
        true
    }

    pub(crate) fn apply_closed(&self, generation: u64, cause: &ClosureCause) -> Option<ClosureRecord> {
        let mut state = self.state.write();
        if state.generation != generation {
            return None;
        }
        let record = ClosureRecord::from_cause(cause);
        state.status = SessionStatus::Closed;
        state.last_closure = Some(record.clone());
        state.touch();
        Some(record)
    }

    /// Attach a terminal rendering if `payload` is still the current challenge
    pub(crate) fn attach_rendered(&self, payload: &str, rendered: String) -> bool {
        let mut state = self.state.write();
        match state.challenge.as_mut() {
            Some(challenge) if challenge.raw == payload => {
                challenge.rendered = Some(rendered);
                true
            }
            _ => {
                debug!("Dropping stale QR rendering for session {}", self.id);
                false
            }
        }
    }

    /// Attach an encoded image if `payload` is still the current challenge
    pub(crate) fn attach_encoded(&self, payload: &str, encoded: String) -> bool {
        let mut state = self.state.write();
        match state.challenge.as_mut() {
            Some(challenge) if challenge.raw == payload => {
                challenge.encoded = Some(encoded);
                state.touch();
                true
            }
            _ => {
                debug!("Dropping stale QR image for session {}", self.id);
                false
            }
        }
    }

    /// Count one more attempt and arm a fresh retry timer.
    ///
    /// Any timer armed earlier is cancelled; the returned token is a child of
    /// the session lifetime so removal cancels it too.
    pub(crate) fn arm_retry(&self, policy: &ReconnectPolicy) -> (RetryPlan, CancellationToken) {
        let token = self.lifetime.child_token();
        let mut state = self.state.write();
        state.cancel_retry();
        let plan = Self::next_plan(&mut state, policy);
        state.retry_token = Some(token.clone());
        (plan, token)
    }

    /// Count one more attempt for the already armed timer
    pub(crate) fn advance_retry(&self, policy: &ReconnectPolicy) -> RetryPlan {
        let mut state = self.state.write();
        Self::next_plan(&mut state, policy)
    }

    fn next_plan(state: &mut SessionState, policy: &ReconnectPolicy) -> RetryPlan {
        state.reconnect_attempts = state.reconnect_attempts.saturating_add(1);
        let attempt = state.reconnect_attempts;
        let plan = RetryPlan::new(attempt, policy.delay_for(attempt));
        state.next_retry = Some(plan);
        state.touch();
        plan
    }

    /// The armed timer fired; it is no longer pending
    pub(crate) fn retry_fired(&self) {
        self.state.write().next_retry = None;
    }

    /// Cancel the armed timer, if any
    pub(crate) fn cancel_retry(&self) -> bool {
        self.state.write().cancel_retry()
    }
}
