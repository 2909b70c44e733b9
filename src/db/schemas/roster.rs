//! Roster Schema
//!
//! Manager-scoped view of linked dependents, one document per pair at
//! `rosters/{manager}:{dependent}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntryDoc {
    pub manager_account_id: String,
    pub dependent_account_id: String,
    pub linked_at: DateTime<Utc>,

    /// Digest of the code that created the link
    pub code_digest: String,

    /// Set when the dependent re-links to another manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlinked_at: Option<DateTime<Utc>>,
}

impl RosterEntryDoc {
    pub fn is_active(&self) -> bool {
        self.unlinked_at.is_none()
    }
}

/// Document id for a manager/dependent pair
pub fn roster_entry_id(manager_account_id: &str, dependent_account_id: &str) -> String {
    format!("{}:{}", manager_account_id, dependent_account_id)
}
