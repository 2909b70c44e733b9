//! Credential Gateway
//!
//! Thin adapter surface over the external identity provider: password sign-up
//! and sign-in, federated (social) sign-in with a redirect fallback, forced
//! credential refresh, sign-out, and the out-of-band codes for email
//! verification and password reset. Everything above this module talks to the
//! provider only through [`CredentialGateway`].

mod local;

pub use local::{LocalCredentialGateway, StagedIdentity};

use async_trait::async_trait;
use hyper::StatusCode;
use serde::{Deserialize, Serialize};

use crate::db::schemas::SignInMethod;

/// Errors raised by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("Email already in use by a provider identity")]
    EmailInUse,

    #[error("Password is too weak")]
    WeakPassword,

    #[error("Invalid email address")]
    InvalidEmail,

    #[error("No provider identity for that email")]
    UserNotFound,

    #[error("Wrong password")]
    WrongPassword,

    #[error("Federated sign-in window was closed")]
    PopupClosed,

    #[error("Federated sign-in window was blocked")]
    PopupBlocked,

    #[error("Domain not authorized for federated sign-in")]
    UnauthorizedDomain,

    #[error("Invalid credential: {0}")]
    InvalidToken(String),

    #[error("Session has been signed out")]
    SessionRevoked,

    #[error("Provider error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::EmailInUse => StatusCode::CONFLICT,
            Self::WeakPassword | Self::InvalidEmail => StatusCode::BAD_REQUEST,
            Self::UserNotFound | Self::WrongPassword => StatusCode::UNAUTHORIZED,
            Self::PopupClosed | Self::PopupBlocked => StatusCode::BAD_REQUEST,
            Self::UnauthorizedDomain => StatusCode::FORBIDDEN,
            Self::InvalidToken(_) | Self::SessionRevoked => StatusCode::UNAUTHORIZED,
            Self::Internal(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::EmailInUse => "EMAIL_IN_USE",
            Self::WeakPassword => "WEAK_PASSWORD",
            Self::InvalidEmail => "INVALID_EMAIL",
            Self::UserNotFound => "USER_NOT_FOUND",
            Self::WrongPassword => "WRONG_PASSWORD",
            Self::PopupClosed => "POPUP_CLOSED",
            Self::PopupBlocked => "POPUP_BLOCKED",
            Self::UnauthorizedDomain => "UNAUTHORIZED_DOMAIN",
            Self::InvalidToken(_) => "INVALID_TOKEN",
            Self::SessionRevoked => "SESSION_REVOKED",
            Self::Internal(_) => "PROVIDER_ERROR",
        }
    }

    /// Whether a federated popup failure should fall back to the redirect flow
    pub fn wants_redirect_fallback(&self) -> bool {
        matches!(self, Self::PopupClosed | Self::PopupBlocked)
    }
}

/// An authenticated provider session.
///
/// `token` is opaque to everything except the gateway that issued it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSession {
    pub account_id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub method: SignInMethod,
    pub token: String,
}

/// Identity recovered from a verified token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub account_id: String,
    pub email: String,
}

/// Identity provider interface consumed by the engine
#[async_trait]
pub trait CredentialGateway: Send + Sync {
    /// Create a provider identity with email + password
    async fn create_account_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<ProviderSession, GatewayError>;

    /// Sign in with email + password
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<ProviderSession, GatewayError>;

    /// Start a federated sign-in through the popup flow
    async fn begin_federated_sign_in(&self) -> Result<ProviderSession, GatewayError>;

    /// Collect the result of a redirect-based federated sign-in, if one completed
    async fn federated_redirect_result(&self) -> Result<Option<ProviderSession>, GatewayError>;

    /// Return a valid token for the session, minting a new one when `force` is set
    async fn refresh_credential(
        &self,
        session: &ProviderSession,
        force: bool,
    ) -> Result<String, GatewayError>;

    /// Decode a token into the identity it proves
    async fn verify_credential(&self, token: &str) -> Result<VerifiedIdentity, GatewayError>;

    /// End the provider session
    async fn sign_out(&self, session: &ProviderSession) -> Result<(), GatewayError>;

    /// Mint a code proving control of `email`, to be delivered out of band
    async fn issue_verification_code(
        &self,
        account_id: &str,
        email: &str,
    ) -> Result<String, GatewayError>;

    /// Check a verification code and return the identity it was issued for
    async fn apply_verification_code(&self, code: &str) -> Result<VerifiedIdentity, GatewayError>;

    /// Mint a password-reset code for the password identity behind `email`.
    ///
    /// Fails with `UserNotFound` when there is no password identity.
    async fn issue_password_reset_code(
        &self,
        email: &str,
    ) -> Result<(VerifiedIdentity, String), GatewayError>;

    /// Replace the password named by a reset code.
    ///
    /// Revokes every earlier session and every earlier reset code.
    async fn confirm_password_reset(
        &self,
        code: &str,
        new_password: &str,
    ) -> Result<VerifiedIdentity, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_popup_failures_fall_back_to_redirect() {
        assert!(GatewayError::PopupClosed.wants_redirect_fallback());
        assert!(GatewayError::PopupBlocked.wants_redirect_fallback());
        assert!(!GatewayError::UnauthorizedDomain.wants_redirect_fallback());
    }
}
