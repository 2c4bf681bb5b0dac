use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("validation: {0}")]
    Validation(String),
    #[error("missing required fields")]
    MissingFields(Vec<&'static str>),
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("{0}")]
    Message(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::MissingFields(required) => {
                let payload = json!({
                    "error": "missing required fields",
                    "details": { "required": required },
                });
                (StatusCode::BAD_REQUEST, Json(payload)).into_response()
            }
            other => {
                let status = match &other {
                    AppError::NotFound => StatusCode::NOT_FOUND,
                    AppError::Unauthorized => StatusCode::UNAUTHORIZED,
                    AppError::Validation(_) => StatusCode::BAD_REQUEST,
                    AppError::Conflict(_) => StatusCode::CONFLICT,
                    AppError::Transport(_) => StatusCode::BAD_GATEWAY,
                    AppError::Db(_)
                    | AppError::Provider(_)
                    | AppError::Message(_)
                    | AppError::MissingFields(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                tracing::error!(error = ?other);
                (status, other.to_string()).into_response()
            }
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Error body for the workspace-lifecycle endpoints. Responses carry a
/// generated `request_id` so a failed call can be matched against server logs.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "validation_failed",
            message: message.into(),
            details: None,
        }
    }

    pub fn missing_fields(required: &[&str]) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "validation_failed",
            message: "missing required fields".into(),
            details: Some(json!({ "required": required })),
        }
    }

    pub fn user_not_found(username: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "user_not_found",
            message: format!("user {username} is not registered"),
            details: None,
        }
    }

    pub fn github_auth_required(auth_url: String) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            error: "github_auth_required",
            message: "GitHub authorization is required before provisioning".into(),
            details: Some(json!({ "auth_url": auth_url })),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: "not_found",
            message: message.into(),
            details: None,
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            error: "conflict",
            message: message.into(),
            details: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: "internal_error",
            message: message.into(),
            details: None,
        }
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::NotFound => ApiError::not_found("resource not found"),
            AppError::Validation(msg) => ApiError::validation(msg),
            AppError::Conflict(msg) => ApiError::conflict(msg),
            AppError::MissingFields(required) => ApiError::missing_fields(&required),
            other => {
                tracing::error!(error = ?other);
                ApiError::internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.error,
            "message": self.message,
            "request_id": Uuid::new_v4().to_string(),
        });
        if let Some(details) = self.details {
            body["details"] = details;
        }
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
