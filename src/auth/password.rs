//! Argon2id password records for the local credential provider
//!
//! Hashes are PHC strings, so the salt and cost parameters travel with them.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

use crate::gateway::GatewayError;

/// Minimum accepted password length
pub const MIN_PASSWORD_LEN: usize = 6;

/// Hash `password` with a fresh salt, rejecting ones shorter than [`MIN_PASSWORD_LEN`]
pub fn hash_password(password: &str) -> Result<String, GatewayError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(GatewayError::WeakPassword);
    }

    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| GatewayError::Internal(format!("Failed to hash password: {e}")))
}

/// `Ok(false)` on a wrong password; `Err` when the stored hash is unusable
pub fn verify_password(password: &str, hash: &str) -> Result<bool, GatewayError> {
    let stored = PasswordHash::new(hash)
        .map_err(|e| GatewayError::Internal(format!("Corrupt password record: {e}")))?;

    match Argon2::default().verify_password(password.as_bytes(), &stored) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(GatewayError::Internal(format!("Password check failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_and_salting() {
        let first = hash_password("hunter22").unwrap();
        let second = hash_password("hunter22").unwrap();

        assert!(first.starts_with("$argon2id$"));
        assert_ne!(first, second);
        assert!(verify_password("hunter22", &second).unwrap());
        assert!(!verify_password("hunter23", &first).unwrap());
    }

    #[test]
    fn test_short_password_is_weak() {
        assert!(matches!(
            hash_password("12345"),
            Err(GatewayError::WeakPassword)
        ));
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        assert!(matches!(
            verify_password("hunter22", "plaintext?"),
            Err(GatewayError::Internal(_))
        ));
    }
}
