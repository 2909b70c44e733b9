//! Audit Log Schema
//!
//! Best-effort trail appended to `auditLog/`. Entries are never read back by
//! the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    SessionRecorded {
        session_id: String,
        assignment_id: String,
        /// Progress after the update; absent when the assignment was missing
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntryDoc {
    #[serde(flatten)]
    pub event: AuditEvent,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_account_id: Option<String>,

    pub at: DateTime<Utc>,
}
