use serde::{Deserialize, Serialize};

/// Closed taxonomy every crate-local error enum classifies itself into.
/// HTTP status mapping lives outside this crate; this only names the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthInvalid,
    TenantDisabled,
    RateLimited,
    NotFound,
    PermissionDenied,
    /// Retrieval-specific: hits existed pre-trim but were all trimmed by ACL.
    NoPermission,
    ValidationError,
    ConfigMismatch,
    Timeout,
    UpstreamUnavailable,
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::AuthInvalid => "AUTH_INVALID",
            ErrorCode::TenantDisabled => "TENANT_DISABLED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::NoPermission => "NO_PERMISSION",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::ConfigMismatch => "CONFIG_MISMATCH",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::UpstreamUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::Internal => "INTERNAL_ERROR",
        };
        write!(f, "{}", s)
    }
}

/// Implemented by every crate-local error enum so a caller can classify a
/// propagated error without matching on its concrete type.
pub trait RetrievalError: std::error::Error {
    fn error_code(&self) -> ErrorCode;
}
