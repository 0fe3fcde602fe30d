use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// Application error types
#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed or unsafe SQL rejected by the gate. Never reaches a database.
    #[error("{0}")]
    InvalidSql(String),

    /// Bad request input other than SQL (connection names, URLs, limits).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Target database unreachable or misconfigured. `url` is always masked.
    #[error("Failed to connect to {dialect} database: {message}")]
    Connection {
        dialect: String,
        url: String,
        message: String,
    },

    /// Validated SQL failed at the target database.
    #[error("Query execution failed: {message}")]
    QueryExecution {
        message: String,
        error_type: String,
        execution_time_ms: u64,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("LLM service error: {0}")]
    LlmService(String),

    #[error("Unsupported export format: {0}")]
    UnsupportedFormat(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Short classification used in history error context and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::InvalidSql(_) => "ValidationError",
            AppError::Validation(_) => "ValidationError",
            AppError::Connection { .. } => "ConnectionError",
            AppError::QueryExecution { .. } => "QueryExecutionError",
            AppError::Database(_) => "DatabaseError",
            AppError::LlmService(_) => "LlmServiceError",
            AppError::UnsupportedFormat(_) => "FormatError",
            AppError::NotFound(_) => "NotFound",
            AppError::Internal(_) => "InternalError",
        }
    }

    /// Message without the variant prefix, as stored in query history.
    pub fn message(&self) -> String {
        match self {
            AppError::InvalidSql(msg)
            | AppError::Validation(msg)
            | AppError::Database(msg)
            | AppError::LlmService(msg)
            | AppError::NotFound(msg)
            | AppError::Internal(msg) => msg.clone(),
            AppError::Connection { message, .. } | AppError::QueryExecution { message, .. } => {
                message.clone()
            }
            AppError::UnsupportedFormat(_) => self.to_string(),
        }
    }
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let (status, error_detail) = match self {
            AppError::InvalidSql(_) => (
                StatusCode::BAD_REQUEST,
                ErrorDetail::new("VALIDATION_ERROR", message),
            ),
            AppError::Validation(_) => (
                StatusCode::BAD_REQUEST,
                ErrorDetail::new("VALIDATION_ERROR", message),
            ),
            AppError::Connection { dialect, url, message: cause } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorDetail::new("CONNECTION_ERROR", message).with_details(json!({
                    "error": cause,
                    "databaseType": dialect,
                    "url": url,
                })),
            ),
            AppError::QueryExecution { message: cause, error_type, execution_time_ms } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorDetail::new("EXECUTION_ERROR", message).with_details(json!({
                    "error": cause,
                    "errorType": error_type,
                    "executionTimeMs": execution_time_ms,
                })),
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorDetail::new("DATABASE_ERROR", message),
            ),
            AppError::LlmService(msg) => {
                let enhanced_msg = if msg.contains("not configured") {
                    format!("{} Set the OPENAI_API_KEY environment variable to use natural language queries.", message)
                } else {
                    message
                };
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorDetail::new("NL2SQL_ERROR", enhanced_msg),
                )
            }
            AppError::UnsupportedFormat(format) => (
                StatusCode::BAD_REQUEST,
                ErrorDetail::new("INVALID_FORMAT", message).with_details(json!({ "format": format })),
            ),
            AppError::NotFound(_) => (
                StatusCode::NOT_FOUND,
                ErrorDetail::new("DATABASE_NOT_FOUND", message),
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorDetail::new("INTERNAL_ERROR", message),
            ),
        };

        let body = Json(ErrorResponse {
            error: error_detail,
        });

        (status, body).into_response()
    }
}

/// Convert anyhow::Error to AppError
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Convert rusqlite::Error to AppError
impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Database(err.to_string())
    }
}
