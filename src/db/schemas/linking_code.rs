//! Linking Code Schema
//!
//! Stores linking codes by digest, at `linkingCodes/{digest}`. The plaintext
//! is handed to the dependent once and never persisted. Codes are short-lived
//! and single-use.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Characters a code is drawn from (no 0/O, 1/I)
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Characters per dash-separated group; codes have two groups
pub const CODE_GROUP_LEN: usize = 4;

/// Canonical form of a typed code: trimmed and upper-cased
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Lower-case hex SHA-256 of the normalized code
pub fn digest_code(raw: &str) -> String {
    hex::encode(Sha256::digest(normalize_code(raw).as_bytes()))
}

/// Persisted linking code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkingCodeDoc {
    pub code_digest: String,

    /// Dependent that generated the code
    pub owner_account_id: String,

    pub created_at: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,

    #[serde(default)]
    pub used: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_by_account_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_at: Option<DateTime<Utc>>,

    /// Redemptions tried against this code, accepted or rejected; recorded, not enforced
    #[serde(default)]
    pub attempts: u32,
}

impl LinkingCodeDoc {
    pub fn new(
        code_digest: String,
        owner_account_id: String,
        created_at: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            code_digest,
            owner_account_id,
            created_at,
            expires_at: created_at + ttl,
            used: false,
            used_by_account_id: None,
            used_at: None,
            attempts: 0,
        }
    }

    /// Check if the code can still be redeemed at `now`
    pub fn is_redeemable(&self, now: DateTime<Utc>) -> bool {
        !self.used && now <= self.expires_at
    }

    pub fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    /// Consume the code on behalf of `manager_account_id`
    pub fn mark_used(&mut self, manager_account_id: &str, now: DateTime<Utc>) {
        self.used = true;
        self.used_by_account_id = Some(manager_account_id.to_string());
        self.used_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_digest_ignores_case_and_padding() {
        assert_eq!(digest_code("wxyz-1234"), digest_code("  WXYZ-1234\n"));
        assert_ne!(digest_code("WXYZ-1234"), digest_code("WXYZ-1235"));

        let digest = digest_code("WXYZ-1234");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_alphabet_excludes_ambiguous_characters() {
        for c in [b'0', b'O', b'1', b'I'] {
            assert!(!CODE_ALPHABET.contains(&c));
        }
    }

    #[test]
    fn test_redeemable_window() {
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut code =
            LinkingCodeDoc::new(digest_code("ABCD-EFGH"), "dep".into(), created, Duration::hours(24));

        assert!(code.is_redeemable(created));
        assert!(code.is_redeemable(created + Duration::hours(24)));
        assert!(!code.is_redeemable(created + Duration::hours(24) + Duration::seconds(1)));

        code.mark_used("mgr", created);
        assert!(!code.is_redeemable(created));
        assert_eq!(code.used_by_account_id.as_deref(), Some("mgr"));
        assert_eq!(code.attempts, 0);
    }
}
