use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::engine::dispatcher::DispatchError;
use crate::session::SessionError;
use crate::tools::ToolError;

#[derive(Serialize)]
pub struct ErrorResponse {
    pub ok: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Application error type that converts to HTTP responses.
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    TooManyRequests(String),
    BadGateway(String),
    ServiceUnavailable(String),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, details) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg, None),
            AppError::TooManyRequests(msg) => (StatusCode::TOO_MANY_REQUESTS, msg, None),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg, None),
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg, None),
            AppError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                Some(format!("{:#}", err)),
            ),
        };

        (
            status,
            Json(ErrorResponse {
                ok: false,
                error,
                details,
            }),
        )
            .into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::UnknownWorkflow(_) => AppError::NotFound(err.to_string()),
            DispatchError::InvalidSpec { .. } => AppError::BadRequest(err.to_string()),
            DispatchError::Store(e) => AppError::Internal(e),
        }
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::OutOfOrder { .. } | SessionError::Busy { .. } => {
                AppError::Conflict(err.to_string())
            }
            SessionError::Validation(_) => AppError::BadRequest(err.to_string()),
            SessionError::Tool(tool_err) => match tool_err {
                ToolError::RateLimited { .. } => AppError::TooManyRequests(tool_err.to_string()),
                ToolError::Degraded { .. } => AppError::ServiceUnavailable(tool_err.to_string()),
                ToolError::Rejected { .. } | ToolError::Invalid(_) => {
                    AppError::BadGateway(tool_err.to_string())
                }
            },
            SessionError::Store(e) => AppError::Internal(e),
        }
    }
}
