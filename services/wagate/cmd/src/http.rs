//! HTTP control API.
//!
//! Thin JSON glue over [`ControlService`]; all validation and session logic
//! lives in the session crate.

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use wagate_session::control::{
    ConnectRequest, ConnectResponse, DisconnectRequest, DisconnectResponse, SendRequest,
    SendResponse,
};
use wagate_session::{ControlError, ControlService, SessionSnapshot};

use crate::{component_debug, component_error};

/// Errors returned by HTTP handlers
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    /// Error from the control service
    #[error(transparent)]
    Control(#[from] ControlError),
    /// Request body is not valid JSON for the endpoint
    #[error("invalid request body: {0}")]
    Body(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Body(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Body(_) => StatusCode::BAD_REQUEST,
            ApiError::Control(ControlError::BadRequest(_)) => StatusCode::BAD_REQUEST,
            ApiError::Control(ControlError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Control(ControlError::Unavailable(_)) => StatusCode::CONFLICT,
            ApiError::Control(ControlError::Internal(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            component_error!("http", "Request failed: {}", self);
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build the control API router
pub fn router(control: ControlService) -> Router {
    Router::new()
        .route("/connect", post(connect))
        .route("/send", post(send))
        .route("/status/:session_id", get(status))
        .route("/sessions", get(list))
        .route("/disconnect", post(disconnect))
        .route("/health", get(health))
        .with_state(control)
}

/// POST /connect
async fn connect(
    State(control): State<ControlService>,
    body: Bytes,
) -> Result<Json<ConnectResponse>, ApiError> {
    // an empty body asks for a generated id
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        ConnectRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::Body(e.to_string()))?
    };
    component_debug!("http", "connect sessionId={:?} userId={:?}", request.session_id, request.user_id);
    Ok(Json(control.connect(request).await?))
}

/// POST /send
async fn send(
    State(control): State<ControlService>,
    body: Result<Json<SendRequest>, JsonRejection>,
) -> Result<Json<SendResponse>, ApiError> {
    let Json(request) = body?;
    Ok(Json(control.send(request).await?))
}

/// GET /status/:session_id
async fn status(
    State(control): State<ControlService>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    Ok(Json(control.status(&session_id)?))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

/// GET /sessions?userId=...
async fn list(
    State(control): State<ControlService>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    Json(json!({ "sessions": control.list(params.user_id.as_deref()) }))
}

/// POST /disconnect
async fn disconnect(
    State(control): State<ControlService>,
    body: Result<Json<DisconnectRequest>, JsonRejection>,
) -> Result<Json<DisconnectResponse>, ApiError> {
    let Json(request) = body?;
    Ok(Json(control.disconnect(request).await?))
}

/// GET /health
async fn health(State(control): State<ControlService>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "sessions": control.manager().registry().len(),
    }))
}
