//! Error types for the preview manager.
//!
//! Allocation and spawn errors are returned synchronously to the HTTP layer.
//! Failures after a session has started are recorded on the session instead
//! and only show up through status polling.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PreviewError {
    #[error("No ports available in the preview pool")]
    NoPortsAvailable,

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Invalid project id: {0}")]
    InvalidProjectId(String),

    #[error("Failed to spawn dev server: {0}")]
    SpawnFailure(String),

    #[error("Dev server exited unexpectedly: {0}")]
    UnexpectedExit(String),

    #[error("Dev server did not stop within {0} seconds")]
    StopTimeout(u64),

    #[error("Dev server did not become ready within {0} seconds")]
    ReadyTimeout(u64),

    #[error("Invalid dev command: {0}")]
    InvalidCommand(String),

    #[error("Unknown maintenance action: {0}")]
    UnknownAction(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PreviewError {
    /// Short machine-readable code for JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            PreviewError::NoPortsAvailable => "no_ports_available",
            PreviewError::ProjectNotFound(_) => "project_not_found",
            PreviewError::InvalidProjectId(_) => "invalid_project_id",
            PreviewError::SpawnFailure(_) => "spawn_failure",
            PreviewError::UnexpectedExit(_) => "unexpected_exit",
            PreviewError::StopTimeout(_) => "stop_timeout",
            PreviewError::ReadyTimeout(_) => "ready_timeout",
            PreviewError::InvalidCommand(_) => "invalid_command",
            PreviewError::UnknownAction(_) => "unknown_action",
            PreviewError::Io(_) => "io_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            PreviewError::NoPortsAvailable => StatusCode::SERVICE_UNAVAILABLE,
            PreviewError::ProjectNotFound(_) => StatusCode::NOT_FOUND,
            PreviewError::InvalidProjectId(_) | PreviewError::UnknownAction(_) => {
                StatusCode::BAD_REQUEST
            }
            PreviewError::SpawnFailure(_)
            | PreviewError::UnexpectedExit(_)
            | PreviewError::StopTimeout(_)
            | PreviewError::ReadyTimeout(_)
            | PreviewError::InvalidCommand(_)
            | PreviewError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retriable(&self) -> bool {
        matches!(self, PreviewError::NoPortsAvailable)
    }
}

impl IntoResponse for PreviewError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.to_string(),
            "code": self.code(),
            "retriable": self.is_retriable(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(
            PreviewError::NoPortsAvailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            PreviewError::ProjectNotFound("a".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            PreviewError::InvalidProjectId("../x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            PreviewError::SpawnFailure("enoent".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn only_pool_exhaustion_is_retriable() {
        assert!(PreviewError::NoPortsAvailable.is_retriable());
        assert!(!PreviewError::ProjectNotFound("a".into()).is_retriable());
        assert!(!PreviewError::SpawnFailure("x".into()).is_retriable());
    }
}
