// crates/backend-lib/src/error.rs

//! Central error type + Axum integration.
use crate::registry::RegistryError;
use crate::session::SessionError;
use crate::validation::ValidationError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use duet_common::{FrameError, ServerMessage};
use thiserror::Error;

/// Application error types with error codes and context
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed chunk frame: {0}")]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Coordinator is not running")]
    CoordinatorUnavailable,
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Validation(_) | AppError::Frame(_) | AppError::Json(_) => {
                StatusCode::BAD_REQUEST
            },
            AppError::Registry(RegistryError::RoomFull(_)) => StatusCode::CONFLICT,
            AppError::Session(SessionError::AlreadyClosing(_)) => StatusCode::CONFLICT,
            AppError::CoordinatorUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Auth(_) => "AUTH_001",
            AppError::Config(_) => "CONFIG_001",
            AppError::Io(_) => "IO_001",
            AppError::Json(_) => "MALFORMED_MESSAGE",
            AppError::Frame(_) => "MALFORMED_CHUNK",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Registry(RegistryError::RoomFull(_)) => "ROOM_FULL",
            AppError::Registry(RegistryError::AlreadyInRoom { .. }) => "ALREADY_IN_ROOM",
            AppError::Registry(RegistryError::UnknownPeer(_)) => "UNKNOWN_PEER",
            AppError::Session(_) => "SESSION_001",
            AppError::CoordinatorUnavailable => "INT_002",
        }
    }

    /// Get a sanitized message suitable for production use
    pub fn sanitized_message(&self) -> String {
        match self {
            AppError::Auth(_) => "Authentication failed".to_string(),
            AppError::Config(_) | AppError::Io(_) => {
                "An internal server error occurred".to_string()
            },
            AppError::Json(_) => "Invalid message format".to_string(),
            AppError::Frame(_) => "Invalid media chunk frame".to_string(),
            AppError::Validation(_) => "Invalid input provided".to_string(),
            AppError::Registry(RegistryError::RoomFull(_)) => {
                "Room is full. Only two people can join a room.".to_string()
            },
            AppError::Registry(_) => "Room request rejected".to_string(),
            AppError::Session(_) => "Recording session unavailable".to_string(),
            AppError::CoordinatorUnavailable => "Service is shutting down".to_string(),
        }
    }

    /// Detailed message in debug builds, sanitized otherwise
    pub fn client_message(&self) -> String {
        if cfg!(debug_assertions) {
            self.to_string()
        } else {
            self.sanitized_message()
        }
    }

    /// The `error` event sent to a WebSocket peer
    pub fn to_server_message(&self) -> ServerMessage {
        ServerMessage::Error {
            code: self.error_code().to_string(),
            message: self.client_message(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": {
                "code": self.error_code(),
                "message": self.client_message(),
            }
        });

        (status, axum::Json(body)).into_response()
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for AppError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        AppError::CoordinatorUnavailable
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for AppError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        AppError::CoordinatorUnavailable
    }
}

impl From<figment::Error> for AppError {
    fn from(err: figment::Error) -> Self {
        AppError::Config(err.to_string())
    }
}
