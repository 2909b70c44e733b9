//! Common metadata for all documents
//!
//! Tracks creation and update timestamps. Timestamps come from the engine
//! clock, never from the store, so tests can drive them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Common metadata for all documents
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    /// When the document was created
    pub created_at: DateTime<Utc>,

    /// When the document was last updated
    pub updated_at: DateTime<Utc>,
}

impl Metadata {
    /// Create new metadata stamped at `now`
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
        }
    }

    /// Record a modification
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}
