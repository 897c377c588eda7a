//! REST client for the session API.
//!
//! The REST path is the guaranteed-persistence leg of a send and the only
//! way to load sessions. [`SessionApi`] is the seam the session controllers
//! depend on; [`RestClient`] implements it over HTTP with `reqwest`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use deskline_proto::message::{ChatSession, Message, MessageId, SessionId, SessionSummary};
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

/// Errors returned by the REST API client.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request could not be sent or the response could not be read.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },

    /// The server rejected the bearer token.
    #[error("unauthorized")]
    Unauthorized,

    /// The response body was not the expected JSON.
    #[error("failed to decode response: {0}")]
    Decode(#[source] serde_json::Error),

    /// The configured base URL cannot carry API paths.
    #[error("invalid API base URL: {0}")]
    InvalidBaseUrl(String),
}

/// Session operations the controllers need from the server.
pub trait SessionApi: Send + Sync {
    /// Persists a message in `session_id`.
    ///
    /// `temp_id` lets the server collapse a message that also arrives over
    /// the WebSocket into a single stored copy.
    fn send_message(
        &self,
        session_id: &SessionId,
        content: &str,
        temp_id: Option<&MessageId>,
    ) -> impl Future<Output = Result<Message, ApiError>> + Send;

    /// Loads a session with its full message history.
    fn get_session(
        &self,
        session_id: &SessionId,
    ) -> impl Future<Output = Result<ChatSession, ApiError>> + Send;

    /// Lists the sessions visible to the caller.
    fn list_sessions(&self) -> impl Future<Output = Result<Vec<SessionSummary>, ApiError>> + Send;

    /// Marks the counterpart's messages in `session_id` as read.
    fn mark_read(
        &self,
        session_id: &SessionId,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PostMessageBody<'a> {
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    temp_id: Option<&'a MessageId>,
}

/// HTTP implementation of [`SessionApi`].
///
/// Clones share the connection pool and the bearer token, so replacing the
/// token with [`set_token`](Self::set_token) affects every clone.
#[derive(Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: Url,
    token: Arc<RwLock<Option<String>>>,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url.as_str())
            .field("authenticated", &self.token.read().is_some())
            .finish_non_exhaustive()
    }
}

impl RestClient {
    /// Creates a client for the API rooted at `base_url`
    /// (e.g. `http://localhost:5000/api`).
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidBaseUrl`] if `base_url` is not an
    /// `http`/`https` URL, or [`ApiError::Http`] if the HTTP client cannot
    /// be built.
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let base_url =
            Url::parse(base_url).map_err(|e| ApiError::InvalidBaseUrl(format!("{base_url}: {e}")))?;
        if !matches!(base_url.scheme(), "http" | "https") || base_url.cannot_be_a_base() {
            return Err(ApiError::InvalidBaseUrl(base_url.to_string()));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            token: Arc::new(RwLock::new(token)),
        })
    }

    /// Replaces the bearer token, e.g. after a re-login.
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }

    /// Base URL of the API.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Opens a new session for the calling user.
    ///
    /// Not part of [`SessionApi`]: the controllers never create sessions.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] if the request fails or is rejected.
    pub async fn create_session(&self) -> Result<ChatSession, ApiError> {
        let url = self.endpoint(&["sessions"])?;
        let response = self.execute(self.client.post(url)).await?;
        decode(response).await
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ApiError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let token = self.token.read().clone();
        let request = match token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().await?;
        let status = response.status();
        tracing::debug!(status = %status, url = %response.url(), "API response received");

        if status == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(ApiError::Decode)
}

impl SessionApi for RestClient {
    async fn send_message(
        &self,
        session_id: &SessionId,
        content: &str,
        temp_id: Option<&MessageId>,
    ) -> Result<Message, ApiError> {
        let url = self.endpoint(&["sessions", session_id.as_str(), "messages"])?;
        let body = PostMessageBody { content, temp_id };
        let response = self.execute(self.client.post(url).json(&body)).await?;
        decode(response).await
    }

    async fn get_session(&self, session_id: &SessionId) -> Result<ChatSession, ApiError> {
        let url = self.endpoint(&["sessions", session_id.as_str()])?;
        let response = self.execute(self.client.get(url)).await?;
        decode(response).await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, ApiError> {
        let url = self.endpoint(&["sessions"])?;
        let response = self.execute(self.client.get(url)).await?;
        decode(response).await
    }

    async fn mark_read(&self, session_id: &SessionId) -> Result<(), ApiError> {
        let url = self.endpoint(&["sessions", session_id.as_str(), "mark-read"])?;
        self.execute(self.client.patch(url)).await?;
        Ok(())
    }
}
