//! Shared error types for Gatehouse
//!
//! The variants here are the error surface callers see: each maps to one HTTP
//! status, and the router renders them as JSON bodies. Internal causes never
//! include caller credentials.

use hyper::StatusCode;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway error taxonomy
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Connection-level authentication failure with a machine-readable reason
    #[error("authentication failed: {reason}")]
    Auth { reason: String },

    /// Malformed or invalid request body/parameter
    #[error("invalid request: {field}: {message}")]
    InvalidRequest { field: String, message: String },

    /// Billing gate denied the request
    #[error("{reason}")]
    BillingDenied {
        reason: String,
        status: Option<String>,
    },

    /// Missing or unusable credentials
    #[error("unauthorized")]
    Unauthorized,

    /// Request method not accepted on this path
    #[error("method not allowed")]
    MethodNotAllowed { allowed: Vec<&'static str> },

    /// Request body exceeded the configured cap
    #[error("payload too large (limit {limit} bytes)")]
    PayloadTooLarge { limit: usize },

    /// Startup configuration problem (exit code 1)
    #[error("configuration error: {0}")]
    Config(String),

    /// Secret dereference failed at startup (exit code 2)
    #[error("secret resolution failed: {0}")]
    Secret(String),

    /// Listener could not bind (exit code 3)
    #[error("bind failed: {0}")]
    Bind(std::io::Error),

    /// Anything else; surfaced to callers as a generic internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Convenience constructor for auth failures
    pub fn auth(reason: impl Into<String>) -> Self {
        Self::Auth {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for invalid-request errors
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for internal errors
    pub fn internal(cause: impl Into<String>) -> Self {
        Self::Internal(cause.into())
    }

    /// HTTP status the router uses when rendering this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth { .. } | Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::BillingDenied { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Config(_) | Self::Secret(_) | Self::Bind(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// OpenAI-style error `type` field for the adapter's error bodies
    pub fn openai_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request_error",
            Self::BillingDenied { .. } => "billing_error",
            Self::Auth { .. } | Self::Unauthorized => "authentication_error",
            _ => "api_error",
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidRequest {
            field: "body".to_string(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            GatewayError::auth("token_mismatch").status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::BillingDenied {
                reason: "no funds".into(),
                status: None
            }
            .status_code(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            GatewayError::PayloadTooLarge { limit: 1024 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn test_openai_error_types() {
        assert_eq!(
            GatewayError::invalid("messages", "must be an array").openai_type(),
            "invalid_request_error"
        );
        assert_eq!(
            GatewayError::internal("boom").openai_type(),
            "api_error"
        );
    }
}
