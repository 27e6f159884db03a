//! The abstract error taxonomy shared by every backend adapter, the session
//! registry, the message hub, and the upload orchestrator.
//!
//! Adapters never return raw `std::io::Error` or backend-native failures to
//! callers outside this crate; they wrap them into one of the kinds below so
//! that the HTTP and wire-protocol layers have a single, small surface to
//! map from.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("integrity check failed: {0}")]
    IntegrityFailed(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backpressure: {0}")]
    Backpressure(String),

    #[error("cancelled")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("backend I/O error: {0}")]
    BackendIo(#[from] std::io::Error),

    #[error("unsupported message type: {0}")]
    UnsupportedType(String),
}

impl GatewayError {
    /// Abstract kind name, used for log lines and the wire `error_type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::NotFound(_) => "not-found",
            GatewayError::AlreadyExists(_) => "already-exists",
            GatewayError::PermissionDenied(_) => "permission-denied",
            GatewayError::NotImplemented(_) => "not-implemented",
            GatewayError::IntegrityFailed(_) => "integrity-failed",
            GatewayError::Conflict(_) => "conflict",
            GatewayError::Backpressure(_) => "backpressure",
            GatewayError::Cancelled => "cancelled",
            GatewayError::InvalidArgument(_) => "invalid-argument",
            GatewayError::BackendIo(_) => "backend-io",
            GatewayError::UnsupportedType(_) => "unsupported-type",
        }
    }

    /// Maps an error kind onto an HTTP status code for the upload/download
    /// endpoints.
    pub fn http_status(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::AlreadyExists(_) => StatusCode::BAD_REQUEST,
            GatewayError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            GatewayError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            GatewayError::IntegrityFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::Backpressure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            GatewayError::BackendIo(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::UnsupportedType(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Maps an error kind onto the `error_type` field used by the wire
    /// protocol's `{type: "error"}` envelope. The caller picks which of the
    /// per-request-type error names applies; this gives the generic
    /// fallback.
    pub fn wire_error_type(&self) -> &'static str {
        match self {
            GatewayError::PermissionDenied(_) => "auth_error",
            GatewayError::UnsupportedType(_) => "unsupported_type",
            _ => "storage_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
