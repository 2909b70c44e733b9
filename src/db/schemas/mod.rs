//! Document schemas for CareLink
//!
//! Defines the documents behind every logical collection: accounts, email
//! claims, linking codes, assignments, sessions, rosters and the audit log.

mod account;
mod assignment;
mod audit;
mod email_claim;
mod linking_code;
mod metadata;
mod roster;
mod session;

pub use account::{AccountDoc, AccountStatus, ProfileFields, Role, SignInMethod};
pub use assignment::{AssignmentDoc, AssignmentState, MAX_PROGRESS};
pub use audit::{AuditEntryDoc, AuditEvent};
pub use email_claim::{normalize_email, EmailClaimDoc};
pub use linking_code::{digest_code, normalize_code, LinkingCodeDoc, CODE_ALPHABET, CODE_GROUP_LEN};
pub use metadata::Metadata;
pub use roster::{roster_entry_id, RosterEntryDoc};
pub use session::{SessionDoc, SessionPayload};
