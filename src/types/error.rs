//! Error types for CareLink
//!
//! One enum for every failure the engine can surface. Retryable store kinds
//! (conflicts, stale credentials, transient network) are absorbed by the retry
//! policy and only show up here once every attempt has failed.

use hyper::StatusCode;

use crate::db::schemas::Role;
use crate::db::StoreError;
use crate::gateway::GatewayError;

/// Main error type for CareLink operations
#[derive(Debug, thiserror::Error)]
pub enum CarelinkError {
    #[error("Email already registered: {email}")]
    EmailAlreadyRegistered { email: String },

    #[error("Linking code is invalid or expired")]
    InvalidOrExpiredCode,

    #[error("Verification or reset code is invalid or expired")]
    InvalidActionCode,

    #[error("Assignment not found: {0}")]
    AssignmentNotFound(String),

    #[error("Concurrent writes on {key} still conflicting after {attempts} attempts")]
    ContentionExhausted { key: String, attempts: u32 },

    #[error("Credential still stale after {attempts} refresh attempts")]
    StaleCredential { attempts: u32 },

    #[error("Permission denied on {key} after {attempts} attempts")]
    PermissionDenied { key: String, attempts: u32 },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid email: {0:?}")]
    InvalidEmail(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Session identity {actual} does not match {expected}")]
    IdentityMismatch { expected: String, actual: String },

    #[error("Account {account_id} is not a {expected:?} account")]
    RoleMismatch {
        account_id: String,
        expected: Role,
        actual: Option<Role>,
    },

    #[error("No profile exists for account {0}")]
    ProfileMissing(String),

    #[error("Account disabled: {0}")]
    AccountDisabled(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Dependent {dependent} is not linked to manager {manager}")]
    NotLinked { dependent: String, manager: String },

    #[error("Credential provider error: {0}")]
    Credential(#[from] GatewayError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CarelinkError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::EmailAlreadyRegistered { .. } => StatusCode::CONFLICT,
            Self::InvalidOrExpiredCode => StatusCode::BAD_REQUEST,
            Self::InvalidActionCode => StatusCode::BAD_REQUEST,
            Self::AssignmentNotFound(_) => StatusCode::NOT_FOUND,
            Self::ContentionExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::StaleCredential { .. } => StatusCode::UNAUTHORIZED,
            Self::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidEmail(_) => StatusCode::BAD_REQUEST,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::IdentityMismatch { .. } => StatusCode::FORBIDDEN,
            Self::RoleMismatch { .. } => StatusCode::FORBIDDEN,
            Self::ProfileMissing(_) => StatusCode::NOT_FOUND,
            Self::AccountDisabled(_) => StatusCode::FORBIDDEN,
            Self::AccountNotFound(_) => StatusCode::NOT_FOUND,
            Self::NotLinked { .. } => StatusCode::FORBIDDEN,
            Self::Credential(e) => e.status_code(),
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Cancelled => StatusCode::REQUEST_TIMEOUT,
            Self::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for API clients
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmailAlreadyRegistered { .. } => "EMAIL_ALREADY_REGISTERED",
            Self::InvalidOrExpiredCode => "INVALID_OR_EXPIRED_CODE",
            Self::InvalidActionCode => "INVALID_ACTION_CODE",
            Self::AssignmentNotFound(_) => "ASSIGNMENT_NOT_FOUND",
            Self::ContentionExhausted { .. } => "STORE_CONTENTION",
            Self::StaleCredential { .. } => "STALE_CREDENTIAL",
            Self::PermissionDenied { .. } => "PERMISSION_DENIED",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::InvalidEmail(_) => "INVALID_EMAIL",
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::IdentityMismatch { .. } => "IDENTITY_MISMATCH",
            Self::RoleMismatch { .. } => "ROLE_MISMATCH",
            Self::ProfileMissing(_) => "PROFILE_MISSING",
            Self::AccountDisabled(_) => "ACCOUNT_DISABLED",
            Self::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            Self::NotLinked { .. } => "NOT_LINKED",
            Self::Credential(e) => e.code(),
            Self::Store(_) => "STORE_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::Config(_) => "CONFIG_ERROR",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<serde_json::Error> for CarelinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for CarelinkError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

/// Result type alias for CareLink operations
pub type Result<T> = std::result::Result<T, CarelinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invariant_errors_map_to_client_statuses() {
        let err = CarelinkError::EmailAlreadyRegistered {
            email: "a@example.com".into(),
        };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.code(), "EMAIL_ALREADY_REGISTERED");

        assert_eq!(
            CarelinkError::InvalidOrExpiredCode.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(CarelinkError::InvalidActionCode.code(), "INVALID_ACTION_CODE");
    }

    #[test]
    fn test_store_errors_convert() {
        let err: CarelinkError = StoreError::Backend("boom".into()).into();
        assert!(matches!(err, CarelinkError::Store(_)));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
