//! REST endpoints for sessions and messages.
//!
//! All routes require a development bearer token (see [`crate::auth`]).
//!
//! | Method | Path                        | Body              | Response            |
//! |--------|-----------------------------|-------------------|---------------------|
//! | POST   | `/sessions`                 |                   | `ChatSession`       |
//! | GET    | `/sessions`                 |                   | `[SessionSummary]`  |
//! | GET    | `/sessions/{id}`            |                   | `ChatSession`       |
//! | POST   | `/sessions/{id}/messages`   | `{content, tempId?}` | `Message`        |
//! | PATCH  | `/sessions/{id}/mark-read`  |                   | `{success, updated}`|

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use deskline_proto::message::{ChatSession, Message, MessageId, SessionId, SessionSummary};
use serde::Deserialize;

use crate::auth::{Principal, Role};
use crate::hub::ServerState;
use crate::store::StoreError;

/// Error response of the REST API, rendered as `{"error": "..."}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing or invalid bearer token.
    #[error("unauthorized")]
    Unauthorized,
    /// The caller may not perform this operation.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// The addressed resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The request was understood but rejected.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => Self::NotFound(e.to_string()),
            StoreError::Forbidden(_) => Self::Forbidden(e.to_string()),
            StoreError::Closed(_) | StoreError::Invalid(_) => Self::BadRequest(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

/// Body of `POST /sessions/{id}/messages`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessageBody {
    /// Message text.
    pub content: String,
    /// Temporary ID of the optimistic client copy, for de-duplication
    /// against the same message delivered over the WebSocket.
    #[serde(default)]
    pub temp_id: Option<MessageId>,
}

/// Builds the REST router, relative to the API prefix.
pub fn routes() -> axum::Router<Arc<ServerState>> {
    axum::Router::new()
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/messages", post(post_message))
        .route("/sessions/{id}/mark-read", patch(mark_read))
}

async fn create_session(
    State(state): State<Arc<ServerState>>,
    principal: Principal,
) -> Result<(StatusCode, Json<ChatSession>), ApiError> {
    if principal.role != Role::User {
        return Err(ApiError::Forbidden(
            "only users can open sessions".to_string(),
        ));
    }
    let session = state.store.create_session(principal.user_id).await;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn list_sessions(
    State(state): State<Arc<ServerState>>,
    principal: Principal,
) -> Json<Vec<SessionSummary>> {
    Json(state.store.list(&principal).await)
}

async fn get_session(
    State(state): State<Arc<ServerState>>,
    principal: Principal,
    Path(id): Path<String>,
) -> Result<Json<ChatSession>, ApiError> {
    let session = state.store.get(&principal, &SessionId::new(id)).await?;
    Ok(Json(session))
}

async fn post_message(
    State(state): State<Arc<ServerState>>,
    principal: Principal,
    Path(id): Path<String>,
    Json(body): Json<PostMessageBody>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let session_id = SessionId::new(id);
    let appended = state
        .store
        .append(
            &principal,
            &session_id,
            &body.content,
            body.temp_id.as_ref(),
        )
        .await?;

    if appended.duplicate {
        return Ok((StatusCode::OK, Json(appended.message)));
    }

    tracing::info!(
        session_id = %session_id,
        message_id = %appended.message.id,
        "message stored via REST"
    );
    state.notify_counterpart(principal.role, &appended).await;
    Ok((StatusCode::CREATED, Json(appended.message)))
}

async fn mark_read(
    State(state): State<Arc<ServerState>>,
    principal: Principal,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let updated = state
        .store
        .mark_read(&principal, &SessionId::new(id))
        .await?;
    Ok(Json(
        serde_json::json!({ "success": true, "updated": updated }),
    ))
}
