use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use courier_shared::error::{ErrorCode, LookupError, ProtocolError};
use courier_shared::protocol::ServerEvent;
use courier_shared::types::{ConversationId, UserId};

use crate::storage::StorageError;

/// Every failure is scoped to one event on one connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServerError {
    #[error("Not authenticated: {0}")]
    Unauthenticated(String),

    #[error("User {user} is not a participant of conversation {conversation}")]
    AccessDenied {
        user: UserId,
        conversation: ConversationId,
    },

    #[error("Illegal transition: {0}")]
    IllegalTransition(String),

    #[error("User {0} is not connected")]
    PeerUnreachable(UserId),

    #[error("Lookup failed: {0}")]
    LookupFailed(String),

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("Malformed event: {0}")]
    Malformed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Too many events, slow down")]
    RateLimited,

    #[error("Signed in from another connection")]
    SessionReplaced,
}

impl ServerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ServerError::Unauthenticated(_) => ErrorCode::Unauthenticated,
            ServerError::AccessDenied { .. } => ErrorCode::AccessDenied,
            ServerError::IllegalTransition(_) => ErrorCode::IllegalTransition,
            ServerError::PeerUnreachable(_) => ErrorCode::PeerUnreachable,
            ServerError::LookupFailed(_) => ErrorCode::LookupFailed,
            ServerError::StorageFailure(_) => ErrorCode::StorageFailure,
            ServerError::Malformed(_) => ErrorCode::MalformedEvent,
            ServerError::NotFound(_) => ErrorCode::NotFound,
            ServerError::RateLimited => ErrorCode::RateLimited,
            ServerError::SessionReplaced => ErrorCode::SessionReplaced,
        }
    }

    pub fn to_event(&self) -> ServerEvent {
        // Storage internals stay in the logs.
        let message = match self {
            ServerError::StorageFailure(_) => "Could not be saved, try again".to_string(),
            ServerError::LookupFailed(_) => "Lookup failed, try again".to_string(),
            other => other.to_string(),
        };
        ServerEvent::error(self.code(), message)
    }
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        ServerError::Malformed(err.to_string())
    }
}

impl From<LookupError> for ServerError {
    fn from(err: LookupError) -> Self {
        ServerError::LookupFailed(err.0)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::Unauthenticated(_) | ServerError::SessionReplaced => {
                StatusCode::UNAUTHORIZED
            }
            ServerError::AccessDenied { .. } => StatusCode::FORBIDDEN,
            ServerError::IllegalTransition(_) => StatusCode::CONFLICT,
            ServerError::PeerUnreachable(_) | ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::LookupFailed(_) | ServerError::StorageFailure(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ServerError::Malformed(_) => StatusCode::BAD_REQUEST,
            ServerError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        };

        let body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Convert a collaborator failure on a lookup path.
pub fn lookup_failed(err: StorageError) -> ServerError {
    ServerError::LookupFailed(err.to_string())
}

/// Convert a collaborator failure on a write path.
pub fn storage_failed(err: StorageError) -> ServerError {
    ServerError::StorageFailure(err.to_string())
}
