//! Error Types for the KINETIC API
//!
//! This module defines error handling for the transport layer:
//! - ApiError struct for structured error responses
//! - ErrorCode enum for categorizing errors
//! - IntoResponse implementation for Axum HTTP responses
//!
//! All errors are serialized as JSON with appropriate HTTP status codes. The
//! WebSocket layer reuses the message of an ApiError in its `error` frames.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use kinetic_core::{BridgeError, ComputeError, ConfigError};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error codes for API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ========================================================================
    // Validation Errors (400)
    // ========================================================================
    /// Request contains invalid input data
    InvalidInput,

    /// Field format is incorrect
    InvalidFormat,

    /// Arguments rejected for the operation
    InvalidArguments,

    // ========================================================================
    // Not Found Errors (404)
    // ========================================================================
    /// No operation registered under the requested name
    OperationNotFound,

    /// No subscription under the requested key
    SubscriptionNotFound,

    // ========================================================================
    // Conflict Errors (409)
    // ========================================================================
    /// The computation depends on itself
    CyclicDependency,

    // ========================================================================
    // Server Errors (500, 503)
    // ========================================================================
    /// A production failed outside of a cached result
    ProductionFailed,

    /// Internal server error
    InternalError,

    /// Service is temporarily unavailable
    ServiceUnavailable,
}

impl ErrorCode {
    /// Get the HTTP status code for this error code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidInput | ErrorCode::InvalidFormat | ErrorCode::InvalidArguments => {
                StatusCode::BAD_REQUEST
            }

            ErrorCode::OperationNotFound | ErrorCode::SubscriptionNotFound => {
                StatusCode::NOT_FOUND
            }

            ErrorCode::CyclicDependency => StatusCode::CONFLICT,

            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,

            ErrorCode::ProductionFailed | ErrorCode::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get a default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "Invalid input data",
            ErrorCode::InvalidFormat => "Invalid format",
            ErrorCode::InvalidArguments => "Invalid arguments",
            ErrorCode::OperationNotFound => "Operation not found",
            ErrorCode::SubscriptionNotFound => "Subscription not found",
            ErrorCode::CyclicDependency => "Cyclic dependency detected",
            ErrorCode::ProductionFailed => "Production failed",
            ErrorCode::InternalError => "Internal server error",
            ErrorCode::ServiceUnavailable => "Service temporarily unavailable",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// API ERROR STRUCT
// ============================================================================

/// Structured error response for API operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code categorizing the error
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    /// Create a new error with a custom message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Create an error carrying the code's default message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    // ========================================================================
    // Convenience constructors
    // ========================================================================

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn invalid_format(field: &str, expected: &str) -> Self {
        Self::new(
            ErrorCode::InvalidFormat,
            format!("Field '{}' has invalid format, expected {}", field, expected),
        )
    }

    pub fn operation_not_found(operation: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::OperationNotFound,
            format!("Operation '{}' not found", operation),
        )
    }

    pub fn subscription_not_found(key: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::SubscriptionNotFound,
            format!("No subscription for {}", key),
        )
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

// ============================================================================
// AXUM INTEGRATION
// ============================================================================

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = %self.code, message = %self.message, "Request failed");
        } else {
            tracing::debug!(code = %self.code, message = %self.message, "Request rejected");
        }
        (status, Json(self)).into_response()
    }
}

// ============================================================================
// CONVERSIONS
// ============================================================================

impl From<ComputeError> for ApiError {
    fn from(err: ComputeError) -> Self {
        match &err {
            ComputeError::UnknownOperation { operation } => Self::operation_not_found(operation),
            ComputeError::InvalidArguments { .. } => {
                Self::new(ErrorCode::InvalidArguments, err.to_string())
            }
            ComputeError::CyclicDependency { chain } => {
                Self::new(ErrorCode::CyclicDependency, err.to_string())
                    .with_details(serde_json::json!({ "chain": chain }))
            }
            ComputeError::Production(failure) => {
                Self::new(ErrorCode::ProductionFailed, failure.message.clone())
            }
            ComputeError::ProductionAborted { .. } => Self::internal_error(err.to_string()),
        }
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Compute(inner) => inner.into(),
            BridgeError::SubscriptionClosed { .. } => Self::service_unavailable(err.to_string()),
            BridgeError::PublicationRemoved { .. } => Self::service_unavailable(err.to_string()),
        }
    }
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        Self::internal_error(format!("Configuration error: {}", err))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_input(format!("Invalid JSON: {}", err))
    }
}

// ============================================================================
// TESTS
// ============================================================================
