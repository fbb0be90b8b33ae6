//! Bus error types.
//!
//! [`ErrorCode`] is the serializable error value carried inside replies and
//! API events. [`BusError`] is what the bus API itself returns to callers, and
//! [`HandlerError`] is what a service handler returns to the bus.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Well-known error codes.
pub mod codes {
    pub const INTERNAL_ERROR: &str = "SYS.1000";
    pub const OPERATION_ERROR: &str = "SYS.1001";
    pub const INVALID_ARGUMENT: &str = "SYS.1002";
    pub const UNKNOWN_MESSAGE: &str = "SYS.1003";
    pub const TIMEOUT: &str = "SYS.1004";
    pub const HTTP_ERROR: &str = "SYS.1005";
}

/// Error value carried by failed replies and API events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCode {
    /// One of the [`codes`] constants, or a domain-specific code.
    pub code: String,
    /// Short human readable description of the code.
    pub description: String,
    /// Free-form details about this particular failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// The error that caused this one, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorCode>>,
}

impl ErrorCode {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
            details: None,
            cause: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_cause(mut self, cause: ErrorCode) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Unexpected failure inside the bus or a handler.
    pub fn internal(details: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, "An internal error happened in system").with_details(details)
    }

    /// An operation failed, typically on the transport path.
    pub fn operation(details: impl Into<String>) -> Self {
        Self::new(codes::OPERATION_ERROR, "An operation failed").with_details(details)
    }

    pub fn invalid_argument(details: impl Into<String>) -> Self {
        Self::new(codes::INVALID_ARGUMENT, "One or more API arguments are invalid").with_details(details)
    }

    /// No service is registered for the message.
    pub fn unknown_message(details: impl Into<String>) -> Self {
        Self::new(codes::UNKNOWN_MESSAGE, "Message not recognized by any service").with_details(details)
    }

    /// The request was not answered in time.
    pub fn timeout(details: impl Into<String>) -> Self {
        Self::new(codes::TIMEOUT, "An operation timeout happened").with_details(details)
    }

    pub fn http(details: impl Into<String>) -> Self {
        Self::new(codes::HTTP_ERROR, "An HTTP request failed").with_details(details)
    }

    pub fn is_timeout(&self) -> bool {
        self.code == codes::TIMEOUT
    }

    pub fn is_unknown_message(&self) -> bool {
        self.code == codes::UNKNOWN_MESSAGE
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.description)?;
        if let Some(details) = &self.details {
            write!(f, ": {}", details)?;
        }
        if let Some(cause) = &self.cause {
            write!(f, " (caused by {})", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorCode {}

/// Errors returned by the bus API.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Configuration error, fatal at setup time.
    #[error("configuration error: {0}")]
    Config(String),

    /// A service with the same id is already registered.
    #[error("duplicate service[id:{0}]")]
    DuplicateService(String),

    /// Another consumer already listens on this service id.
    #[error("duplicate consumer for the same service id[{0}]")]
    DuplicateConsumer(String),

    #[error("service[id:{0}] is not registered")]
    ServiceNotFound(String),

    /// The message has no target service id.
    #[error("service id cannot be empty: {0}")]
    MissingServiceId(String),

    #[error("malformed service id: {0}")]
    MalformedServiceId(String),

    /// The bus was used in a way it does not support.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A synchronous failure surfaced to the caller, e.g. an API message
    /// that could not be delivered to a peer.
    #[error("operation failed: {0}")]
    Operation(ErrorCode),

    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("schema reconciliation failed: {0}")]
    Schema(#[from] crate::schema::SchemaError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The bus was stopped before the operation completed.
    #[error("bus is not running")]
    NotRunning,
}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Error returned by a service handler.
///
/// `Operation` is an application failure and is propagated as-is to the
/// reply or API event. `Unexpected` is logged with a full message dump and
/// converted to an internal error.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Operation(#[from] ErrorCode),

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl HandlerError {
    /// Error code to report back to the sender.
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            HandlerError::Operation(code) => code.clone(),
            HandlerError::Unexpected(e) => ErrorCode::internal(format!("{:#}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = ErrorCode::timeout("PingMsg timed out");
        assert!(err.is_timeout());
        assert_eq!(err.code, codes::TIMEOUT);
        assert!(!ErrorCode::internal("x").is_timeout());
    }

    #[test]
    fn test_display_includes_details_and_cause() {
        let err = ErrorCode::operation("peer down").with_cause(ErrorCode::http("connection refused"));
        let s = err.to_string();
        assert!(s.contains(codes::OPERATION_ERROR));
        assert!(s.contains("peer down"));
        assert!(s.contains("connection refused"));
    }

    #[test]
    fn test_error_serialization_skips_empty_fields() {
        let err = ErrorCode::new(codes::INTERNAL_ERROR, "boom");
        let json = serde_json::to_string(&err).unwrap();
        assert!(!json.contains("details"));
        assert!(!json.contains("cause"));

        let parsed: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, err);
    }

    #[test]
    fn test_handler_error_conversion() {
        let op: HandlerError = ErrorCode::invalid_argument("bad uuid").into();
        assert_eq!(op.to_error_code().code, codes::INVALID_ARGUMENT);

        let unexpected: HandlerError = anyhow::anyhow!("disk on fire").into();
        let code = unexpected.to_error_code();
        assert_eq!(code.code, codes::INTERNAL_ERROR);
        assert!(code.details.unwrap().contains("disk on fire"));
    }
}
