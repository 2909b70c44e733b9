//! Assignment Schema
//!
//! A tracked activity a manager assigned to a dependent. Progress only moves
//! up and is capped at 100; the state is always derived from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound for assignment progress
pub const MAX_PROGRESS: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentState {
    Assigned,
    InProgress,
    Completed,
}

impl AssignmentState {
    /// The state implied by a progress value
    pub fn for_progress(progress: u8) -> Self {
        match progress {
            0 => Self::Assigned,
            p if p >= MAX_PROGRESS => Self::Completed,
            _ => Self::InProgress,
        }
    }
}

/// Assignment document, stored at `assignments/{id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentDoc {
    pub id: String,
    pub dependent_account_id: String,
    pub activity_template_id: String,
    pub assigner_account_id: String,

    /// Sessions the manager planned; informational
    #[serde(default)]
    pub scheduled_sessions: u32,

    pub progress: u8,
    pub state: AssignmentState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AssignmentDoc {
    pub fn new(
        id: String,
        dependent_account_id: String,
        activity_template_id: String,
        assigner_account_id: String,
        scheduled_sessions: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            dependent_account_id,
            activity_template_id,
            assigner_account_id,
            scheduled_sessions,
            progress: 0,
            state: AssignmentState::Assigned,
            created_at: now,
            updated_at: now,
        }
    }

    /// Add `increment` points, saturating at [`MAX_PROGRESS`], and re-derive the state
    pub fn advance(&mut self, increment: u8, now: DateTime<Utc>) {
        self.progress = self.progress.saturating_add(increment).min(MAX_PROGRESS);
        self.state = AssignmentState::for_progress(self.progress);
        self.updated_at = now;
    }
}
