//! Identity tokens issued by the local credential provider
//!
//! Tokens are HS256 JWTs. Each carries the account's token generation; signing
//! out bumps the generation so older tokens stop verifying even before `exp`.
//!
//! Action codes (email verification, password reset) are signed with the same
//! key but carry a purpose instead of a generation, so neither kind decodes as
//! the other.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::gateway::GatewayError;
use crate::types::CarelinkError;

/// Payload stored in an identity token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// Provider-issued account id
    pub sub: String,
    /// Email the provider authenticated
    pub email: String,
    /// Token generation at issue time
    pub gen: u32,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

/// What an action code authorizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionPurpose {
    VerifyEmail,
    ResetPassword,
}

/// Payload stored in an action code
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionClaims {
    pub sub: String,
    pub email: String,
    pub purpose: ActionPurpose,
    /// Binds the code to provider state at issue time; empty when unused
    #[serde(default)]
    pub stamp: String,
    pub iat: u64,
    pub exp: u64,
}

/// JWT issuer and verifier
#[derive(Clone)]
pub struct TokenSigner {
    secret: String,
    expiry_seconds: u64,
}

impl TokenSigner {
    /// Create a new signer
    ///
    /// Returns an error if the secret is empty or too short
    pub fn new(secret: String, expiry_seconds: u64) -> Result<Self, CarelinkError> {
        if secret.is_empty() {
            return Err(CarelinkError::Config(
                "JWT_SECRET is required in production mode".into(),
            ));
        }

        if secret.len() < 32 {
            return Err(CarelinkError::Config(
                "JWT_SECRET must be at least 32 characters".into(),
            ));
        }

        Ok(Self {
            secret,
            expiry_seconds,
        })
    }

    /// Create a signer for dev mode
    pub fn new_dev() -> Self {
        Self {
            secret: "dev-mode-secret-not-for-production-use-123456".into(),
            expiry_seconds: 3600,
        }
    }

    /// Issue a token for an authenticated account
    pub fn issue(&self, account_id: &str, email: &str, gen: u32) -> Result<String, GatewayError> {
        let now = unix_now()?;

        let claims = Claims {
            sub: account_id.to_string(),
            email: email.to_string(),
            gen,
            iat: now,
            exp: now + self.expiry_seconds,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| GatewayError::Internal(format!("Failed to issue token: {}", e)))
    }

    /// Verify and decode a token
    pub fn verify(&self, token: &str) -> Result<Claims, GatewayError> {
        self.decode_with(token, Validation::default())
    }

    /// Issue a single-purpose action code valid for `ttl_seconds`
    pub fn issue_action(
        &self,
        account_id: &str,
        email: &str,
        purpose: ActionPurpose,
        stamp: &str,
        ttl_seconds: u64,
    ) -> Result<String, GatewayError> {
        let now = unix_now()?;

        let claims = ActionClaims {
            sub: account_id.to_string(),
            email: email.to_string(),
            purpose,
            stamp: stamp.to_string(),
            iat: now,
            exp: now + ttl_seconds,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| GatewayError::Internal(format!("Failed to issue action code: {}", e)))
    }

    /// Verify an action code minted for `purpose`
    pub fn verify_action(
        &self,
        code: &str,
        purpose: ActionPurpose,
    ) -> Result<ActionClaims, GatewayError> {
        let claims: ActionClaims = self.decode_with(code.trim(), Validation::default())?;
        if claims.purpose != purpose {
            return Err(GatewayError::InvalidToken("Code issued for another purpose".into()));
        }
        Ok(claims)
    }

    /// Verify the signature but accept an expired token.
    ///
    /// Used when refreshing: an expired token still proves which session asks.
    pub fn verify_ignoring_expiry(&self, token: &str) -> Result<Claims, GatewayError> {
        let mut validation = Validation::default();
        validation.validate_exp = false;
        self.decode_with(token, validation)
    }

    fn decode_with<C: DeserializeOwned>(
        &self,
        token: &str,
        validation: Validation,
    ) -> Result<C, GatewayError> {
        decode::<C>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|err| {
            use jsonwebtoken::errors::ErrorKind;
            let reason = match err.kind() {
                ErrorKind::ExpiredSignature => "Token expired",
                ErrorKind::InvalidToken => "Invalid token",
                ErrorKind::InvalidSignature => "Invalid signature",
                _ => "Token validation failed",
            };
            GatewayError::InvalidToken(reason.to_string())
        })
    }
}

fn unix_now() -> Result<u64, GatewayError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| GatewayError::Internal(format!("System time error: {}", e)))
}

/// Extract token from Authorization header.
/// Supports "Bearer <token>" format and raw tokens.
pub fn extract_token_from_header(auth_header: Option<&str>) -> Option<&str> {
    let header = auth_header?;

    if let Some(token) = header.strip_prefix("Bearer ") {
        let token = token.trim();
        if !token.is_empty() {
            return Some(token);
        }
    }

    if !header.contains(' ') {
        let token = header.trim();
        if !token.is_empty() {
            return Some(token);
        }
    }

    None
}
