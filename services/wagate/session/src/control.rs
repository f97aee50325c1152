//! Typed control surface used by the HTTP layer.
//!
//! Requests arrive as loosely filled JSON bodies; this module validates them,
//! drives the lifecycle manager and maps session errors onto a small set of
//! caller-facing categories.

use crate::manager::SessionManager;
use crate::session::{SessionSnapshot, SessionStatus, SessionSummary, SharedSession};
use crate::SessionError;
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use wagate_client::{MessagePayload, SendError};
use wagate_storage::validate_session_id;

/// Length of the random suffix of generated session ids
const ID_SUFFIX_LEN: usize = 6;

/// Errors returned to control callers
#[derive(Error, Debug)]
pub enum ControlError {
    /// Request is malformed
    #[error("{0}")]
    BadRequest(String),
    /// Session does not exist
    #[error("{0}")]
    NotFound(String),
    /// Session exists but cannot serve the request right now
    #[error("{0}")]
    Unavailable(String),
    /// Anything else
    #[error("{0}")]
    Internal(String),
}

impl From<SessionError> for ControlError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound(_) => ControlError::NotFound("session not found".to_string()),
            SessionError::NotConnected(_) => ControlError::Unavailable(e.to_string()),
            SessionError::Send {
                source: SendError::NotOpen,
                ..
            } => ControlError::Unavailable(e.to_string()),
            SessionError::Send {
                source: SendError::InvalidAddress(_),
                ..
            } => ControlError::BadRequest(e.to_string()),
            SessionError::Send { .. } | SessionError::Creation { .. } => {
                ControlError::Internal(e.to_string())
            }
        }
    }
}

/// Body of a connect request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    /// Requested session id; generated when absent
    #[serde(default)]
    pub session_id: Option<String>,
    /// External user to bind
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Result of a connect request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    /// Session id
    pub session_id: String,
    /// Status at the time of the response
    pub status: SessionStatus,
    /// Bound external user
    pub user_id: Option<String>,
    /// Whether an existing session was returned
    pub already_exists: bool,
    /// Pending pairing payload, if any
    pub qr: Option<String>,
}

impl ConnectResponse {
    fn from_session(session: &SharedSession, already_exists: bool) -> Self {
        let snapshot = session.snapshot();
        Self {
            session_id: snapshot.session_id,
            status: snapshot.status,
            user_id: snapshot.user_id,
            already_exists,
            qr: snapshot.qr,
        }
    }
}

/// Body of a send request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    /// Session to send through
    #[serde(default)]
    pub session_id: Option<String>,
    /// Destination address
    #[serde(default)]
    pub jid: Option<String>,
    /// Message text
    #[serde(default)]
    pub text: Option<String>,
}

/// Result of a send request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    /// Always true on success
    pub ok: bool,
    /// Network-assigned message id
    pub message_id: String,
}

/// Body of a disconnect request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectRequest {
    /// Session to terminate
    #[serde(default)]
    pub session_id: Option<String>,
    /// Also delete persisted credentials (logout)
    #[serde(default)]
    pub purge: bool,
}

/// Result of a disconnect request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisconnectResponse {
    /// Always true on success
    pub ok: bool,
}

/// Request/response facade over the lifecycle manager
#[derive(Debug, Clone)]
pub struct ControlService {
    manager: SessionManager,
}

impl ControlService {
    /// Service driving `manager`
    pub fn new(manager: SessionManager) -> Self {
        Self { manager }
    }

    /// Manager behind this service
    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Create a session, or return the one the user or id already has
    pub async fn connect(&self, request: ConnectRequest) -> Result<ConnectResponse, ControlError> {
        let session_id = non_empty(request.session_id);
        let user_id = non_empty(request.user_id);

        if let Some(session_id) = &session_id {
            validate_session_id(session_id).map_err(|e| ControlError::BadRequest(e.to_string()))?;
        }
        let session_id = session_id.unwrap_or_else(generate_session_id);

        let (session, already_exists) = self
            .manager
            .create_if_absent(&session_id, user_id.as_deref())
            .await?;
        if already_exists {
            debug!("Connect returned existing session {}", session.id());
        } else {
            info!("Created session {} via control API", session_id);
        }
        Ok(ConnectResponse::from_session(&session, already_exists))
    }

    /// Send a text message
    pub async fn send(&self, request: SendRequest) -> Result<SendResponse, ControlError> {
        let (Some(session_id), Some(jid), Some(text)) = (
            non_empty(request.session_id),
            non_empty(request.jid),
            non_empty(request.text),
        ) else {
            return Err(ControlError::BadRequest(
                "sessionId, jid and text are required".to_string(),
            ));
        };

        let receipt = self
            .manager
            .send(&session_id, &jid, MessagePayload::text(text))
            .await?;
        Ok(SendResponse {
            ok: true,
            message_id: receipt.message_id,
        })
    }

    /// Diagnostic view of one session
    pub fn status(&self, session_id: &str) -> Result<SessionSnapshot, ControlError> {
        self.manager
            .get(session_id)
            .map(|s| s.snapshot())
            .ok_or_else(|| ControlError::NotFound("not found".to_string()))
    }

    /// Summaries of all sessions, or of one user's
    pub fn list(&self, user_id: Option<&str>) -> Vec<SessionSummary> {
        let user_id = user_id.filter(|u| !u.is_empty());
        self.manager.registry().list_by_user(user_id)
    }

    /// Terminate a session
    pub async fn disconnect(
        &self,
        request: DisconnectRequest,
    ) -> Result<DisconnectResponse, ControlError> {
        let session_id = non_empty(request.session_id)
            .ok_or_else(|| ControlError::BadRequest("sessionId required".to_string()))?;
        self.manager.terminate(&session_id, request.purge).await?;
        Ok(DisconnectResponse { ok: true })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Generate a session id of the form `s_<unix millis>_<6 lowercase alphanumerics>`
pub fn generate_session_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("s_{}_{}", Utc::now().timestamp_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerConfig;
    use crate::registry::SessionRegistry;
    use std::sync::Arc;
    use wagate_client::memory::MemoryConnector;
    use wagate_storage::MemoryCredentialStore;

    fn service() -> (ControlService, Arc<MemoryConnector>) {
        let connector = Arc::new(MemoryConnector::new());
        let manager = SessionManager::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(MemoryCredentialStore::new()),
            connector.clone(),
            ManagerConfig {
                print_terminal_qr: false,
                ..ManagerConfig::default()
            },
        );
        (ControlService::new(manager), connector)
    }

    #[test]
    fn test_generated_ids() {
        let id = generate_session_id();
        let parts: Vec<&str> = id.splitn(3, '_').collect();
        assert_eq!(parts[0], "s");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), ID_SUFFIX_LEN);
        assert!(parts[2]
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(generate_session_id(), generate_session_id());
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_per_user() {
        let (control, connector) = service();
        let first = control
            .connect(ConnectRequest {
                session_id: Some("s3".to_string()),
                user_id: Some("u1".to_string()),
            })
            .await
            .unwrap();
        assert!(!first.already_exists);
        assert_eq!(first.status, SessionStatus::Connecting);

        // same user, no id: returns the bound session
        let second = control
            .connect(ConnectRequest {
                session_id: None,
                user_id: Some("u1".to_string()),
            })
            .await
            .unwrap();
        assert!(second.already_exists);
        assert_eq!(second.session_id, "s3");
        assert_eq!(connector.connect_count("s3"), 1);
        assert_eq!(control.list(Some("u1")).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_connects_for_same_id_open_one_connection() {
        for _ in 0..25 {
            let (control, connector) = service();
            let request = ConnectRequest {
                session_id: Some("s3".to_string()),
                user_id: Some("u1".to_string()),
            };

            let first = tokio::spawn({
                let control = control.clone();
                let request = request.clone();
                async move { control.connect(request).await }
            });
            let second = tokio::spawn({
                let control = control.clone();
                async move { control.connect(request).await }
            });
            let first = first.await.unwrap().unwrap();
            let second = second.await.unwrap().unwrap();

            assert_eq!(first.session_id, "s3");
            assert_eq!(second.session_id, "s3");
            assert!(first.already_exists != second.already_exists);
            assert_eq!(connector.connect_count("s3"), 1);
            assert_eq!(control.manager().registry().user_count(), 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_connects_for_same_user_open_one_connection() {
        for _ in 0..25 {
            let (control, connector) = service();
            let spawn_connect = |id: &str| {
                let control = control.clone();
                let request = ConnectRequest {
                    session_id: Some(id.to_string()),
                    user_id: Some("u1".to_string()),
                };
                tokio::spawn(async move { control.connect(request).await })
            };
            let first = spawn_connect("a");
            let second = spawn_connect("b");
            let first = first.await.unwrap().unwrap();
            let second = second.await.unwrap().unwrap();

            assert_eq!(first.session_id, second.session_id);
            assert_eq!(connector.total_connects(), 1);
            assert_eq!(control.list(None).len(), 1);
            assert_eq!(control.list(Some("u1")).len(), 1);
        }
    }

    #[tokio::test]
    async fn test_failed_connect_releases_reservation() {
        let (control, connector) = service();
        connector.fail_next_connects("s1", 1);
        let request = ConnectRequest {
            session_id: Some("s1".to_string()),
            user_id: Some("u1".to_string()),
        };

        let err = control.connect(request.clone()).await.unwrap_err();
        assert!(matches!(err, ControlError::Internal(_)));
        assert!(control.list(None).is_empty());
        assert!(control.manager().registry().session_for_user("u1").is_none());

        let created = control.connect(request).await.unwrap();
        assert!(!created.already_exists);
        assert_eq!(connector.connect_count("s1"), 1);
    }

    #[tokio::test]
    async fn test_connect_generates_and_validates_ids() {
        let (control, _) = service();
        let created = control.connect(ConnectRequest::default()).await.unwrap();
        assert!(created.session_id.starts_with("s_"));

        let again = control
            .connect(ConnectRequest {
                session_id: Some(created.session_id.clone()),
                user_id: None,
            })
            .await
            .unwrap();
        assert!(again.already_exists);

        let err = control
            .connect(ConnectRequest {
                session_id: Some("../etc".to_string()),
                user_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_send_validation_and_errors() {
        let (control, connector) = service();
        let err = control
            .send(SendRequest {
                session_id: Some("s1".to_string()),
                jid: Some(String::new()),
                text: Some("hi".to_string()),
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "sessionId, jid and text are required");

        let request = SendRequest {
            session_id: Some("s1".to_string()),
            jid: Some("1@s.whatsapp.net".to_string()),
            text: Some("hi".to_string()),
        };
        assert!(matches!(
            control.send(request.clone()).await,
            Err(ControlError::NotFound(_))
        ));

        control
            .connect(ConnectRequest {
                session_id: Some("s1".to_string()),
                user_id: None,
            })
            .await
            .unwrap();
        assert!(matches!(
            control.send(request.clone()).await,
            Err(ControlError::Unavailable(_))
        ));

        connector.latest("s1").unwrap().open();
        let response = control.send(request).await.unwrap();
        assert!(response.ok);
    }

    #[tokio::test]
    async fn test_status_and_disconnect() {
        let (control, _) = service();
        assert!(matches!(
            control.status("s1"),
            Err(ControlError::NotFound(_))
        ));

        control
            .connect(ConnectRequest {
                session_id: Some("s1".to_string()),
                user_id: Some("u1".to_string()),
            })
            .await
            .unwrap();
        let snapshot = control.status("s1").unwrap();
        assert_eq!(snapshot.user_id.as_deref(), Some("u1"));
        assert_eq!(snapshot.reconnect_attempts, 0);

        assert!(matches!(
            control.disconnect(DisconnectRequest::default()).await,
            Err(ControlError::BadRequest(_))
        ));
        control
            .disconnect(DisconnectRequest {
                session_id: Some("s1".to_string()),
                purge: true,
            })
            .await
            .unwrap();
        assert!(control.list(None).is_empty());
        assert!(matches!(
            control
                .disconnect(DisconnectRequest {
                    session_id: Some("s1".to_string()),
                    purge: false,
                })
                .await,
            Err(ControlError::NotFound(_))
        ));
    }
}
