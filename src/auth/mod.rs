//! Credential primitives for the local identity provider
//!
//! Provides:
//! - Password hashing with Argon2
//! - HS256 identity tokens and single-purpose action codes

pub mod jwt;
pub mod password;

pub use jwt::{extract_token_from_header, ActionClaims, ActionPurpose, Claims, TokenSigner};
pub use password::{hash_password, verify_password, MIN_PASSWORD_LEN};
