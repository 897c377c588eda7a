//! Development bearer tokens.
//!
//! Tokens have the form `<role>:<userId>`, e.g. `user:u1` or `admin:a1`.
//! They identify the caller without any signature; the server is only meant
//! for local runs and tests.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use deskline_proto::message::{SenderRole, UserId};

use crate::rest::ApiError;

/// Role of an authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// End user owning their own sessions.
    User,
    /// Support-desk operator with access to every session.
    Admin,
}

impl Role {
    /// Role recorded on messages this caller authors.
    #[must_use]
    pub const fn sender_role(self) -> SenderRole {
        match self {
            Self::User => SenderRole::User,
            Self::Admin => SenderRole::Admin,
        }
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
    /// Caller role.
    pub role: Role,
    /// Caller account.
    pub user_id: UserId,
}

impl Principal {
    /// Parses a development token.
    ///
    /// Returns `None` for an unknown role or an empty user ID.
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        let (role, user_id) = token.split_once(':')?;
        let role = match role {
            "user" => Role::User,
            "admin" => Role::Admin,
            _ => return None,
        };
        if user_id.is_empty() {
            return None;
        }
        Some(Self {
            role,
            user_id: UserId::new(user_id),
        })
    }

    /// Returns the token that authenticates this principal.
    #[must_use]
    pub fn token(&self) -> String {
        let role = match self.role {
            Role::User => "user",
            Role::Admin => "admin",
        };
        format!("{role}:{}", self.user_id)
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Principal {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(ApiError::Unauthorized)?;
        Self::from_token(token.trim()).ok_or(ApiError::Unauthorized)
    }
}
