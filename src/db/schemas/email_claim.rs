//! Email Claim Schema
//!
//! One document per normalized email, stored at `emailClaims/{normalized}`,
//! naming the account that owns the address.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ownership record for a normalized email
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailClaimDoc {
    pub owner_account_id: String,
    pub claimed_at: DateTime<Utc>,
}

/// Trim and lower-case an email address.
///
/// Returns `None` when the result is not shaped like `local@domain.tld`.
pub fn normalize_email(raw: &str) -> Option<String> {
    let normalized = raw.trim().to_lowercase();

    if normalized.chars().any(char::is_whitespace) {
        return None;
    }

    let (local, domain) = normalized.split_once('@')?;
    if local.is_empty() || domain.contains('@') {
        return None;
    }
    let (host, tld) = domain.rsplit_once('.')?;
    if host.is_empty() || tld.is_empty() {
        return None;
    }

    Some(normalized)
}
