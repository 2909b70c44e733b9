//! Session Schema
//!
//! Immutable record of one completed activity instance, appended to
//! `sessions/` before the assignment it belongs to is touched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a dependent reports when finishing an activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPayload {
    pub duration_minutes: u32,

    /// Self-reported effort, 1 (easy) to 10 (maximal)
    pub perceived_effort: u8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl SessionPayload {
    pub fn validate(&self) -> Result<(), String> {
        if self.duration_minutes < 1 {
            return Err("duration_minutes must be at least 1".into());
        }
        if !(1..=10).contains(&self.perceived_effort) {
            return Err("perceived_effort must be between 1 and 10".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDoc {
    pub assignment_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_by: Option<String>,

    #[serde(flatten)]
    pub payload: SessionPayload,

    pub recorded_at: DateTime<Utc>,
}
