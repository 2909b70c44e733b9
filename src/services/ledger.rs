//! Email Claim Ledger
//!
//! `emailClaims/{normalized}` maps every registered address to exactly one
//! account. A claim whose owner account does not exist is an orphan (a signup
//! that claimed the address and never finished) and is handed to the next
//! claimant.
//!
//! [`EmailClaimLedger::plan`] makes the claim decision against a snapshot so
//! the account reconciler can fold it into the same transaction that writes
//! the account document. [`EmailClaimLedger::try_claim`] runs it on its own.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::clock::Clock;
use super::context::OpContext;
use super::retry::{CallerCredentials, RetryPolicy};
use crate::db::schemas::{normalize_email, EmailClaimDoc};
use crate::db::{transact, DocKey, DocumentStore, Snapshot, StoreError, TxnStep, WriteSet};
use crate::types::{CarelinkError, Result};

/// Outcome of claiming an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    /// Nobody held the address; it now belongs to the candidate
    Claimed,
    /// The previous owner account no longer exists; the claim was overwritten
    Reclaimed { previous_owner: String },
    /// The candidate already held the address
    AlreadyOwned,
    /// A live account owns the address
    Conflict { owner: String },
}

impl ClaimResult {
    /// Whether the candidate owns the address afterwards
    pub fn is_owned(&self) -> bool {
        !matches!(self, Self::Conflict { .. })
    }
}

/// Claim decision made against a snapshot
#[derive(Debug, Clone)]
pub enum ClaimPlan {
    /// The snapshot must also cover these keys
    NeedKeys(Vec<DocKey>),
    /// Decided; `write` is the claim document to store, if any
    Decided {
        result: ClaimResult,
        write: Option<EmailClaimDoc>,
    },
}

#[derive(Clone)]
pub struct EmailClaimLedger {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl EmailClaimLedger {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self {
            store,
            clock,
            retry,
        }
    }

    /// Decide a claim of `normalized_email` by `candidate` against `snapshot`.
    ///
    /// The snapshot must cover the claim key. When the claim has a foreign
    /// owner, the owner's account key is requested so orphans can be told
    /// apart from live owners inside the same transaction.
    pub fn plan(
        snapshot: &Snapshot,
        normalized_email: &str,
        candidate: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<ClaimPlan, StoreError> {
        let claim_key = DocKey::email_claim(normalized_email);
        let fresh = || EmailClaimDoc {
            owner_account_id: candidate.to_string(),
            claimed_at: now,
        };

        let Some(claim) = snapshot.decode::<EmailClaimDoc>(&claim_key)? else {
            return Ok(ClaimPlan::Decided {
                result: ClaimResult::Claimed,
                write: Some(fresh()),
            });
        };

        if claim.owner_account_id == candidate {
            return Ok(ClaimPlan::Decided {
                result: ClaimResult::AlreadyOwned,
                write: None,
            });
        }

        let owner_key = DocKey::account(&claim.owner_account_id);
        if !snapshot.covers(&owner_key) {
            return Ok(ClaimPlan::NeedKeys(vec![owner_key]));
        }

        if snapshot.exists(&owner_key) {
            Ok(ClaimPlan::Decided {
                result: ClaimResult::Conflict {
                    owner: claim.owner_account_id,
                },
                write: None,
            })
        } else {
            Ok(ClaimPlan::Decided {
                result: ClaimResult::Reclaimed {
                    previous_owner: claim.owner_account_id,
                },
                write: Some(fresh()),
            })
        }
    }

    /// Claim `email` for `candidate` in a transaction of its own
    pub async fn try_claim(
        &self,
        ctx: &OpContext,
        email: &str,
        candidate: &str,
        credentials: Option<CallerCredentials<'_>>,
    ) -> Result<ClaimResult> {
        let normalized =
            normalize_email(email).ok_or_else(|| CarelinkError::InvalidEmail(email.to_string()))?;
        let claim_key = DocKey::email_claim(&normalized);
        let store = self.store.as_ref();

        let result = self
            .retry
            .run(ctx, "email_claim", credentials, || {
                transact(store, std::slice::from_ref(&claim_key), |snap| {
                    match Self::plan(snap, &normalized, candidate, self.clock.now())? {
                        ClaimPlan::NeedKeys(keys) => Ok(TxnStep::Expand(keys)),
                        ClaimPlan::Decided {
                            result,
                            write: Some(claim),
                        } => {
                            let mut writes = WriteSet::new();
                            writes.put(claim_key.clone(), &claim)?;
                            Ok(TxnStep::Commit(writes, result))
                        }
                        ClaimPlan::Decided {
                            result,
                            write: None,
                        } => Ok(TxnStep::Abort(result)),
                    }
                })
            })
            .await?;

        log_claim(&normalized, candidate, &result);
        Ok(result)
    }

    /// Current owner of `email`, if claimed
    pub async fn owner_of(&self, ctx: &OpContext, email: &str) -> Result<Option<String>> {
        let normalized =
            normalize_email(email).ok_or_else(|| CarelinkError::InvalidEmail(email.to_string()))?;
        let claim_key = DocKey::email_claim(&normalized);
        let store = self.store.as_ref();

        let doc = self
            .retry
            .run(ctx, "email_claim_read", None, || store.get(&claim_key))
            .await?;

        match doc {
            Some(doc) => {
                let claim: EmailClaimDoc = serde_json::from_value(doc.body)
                    .map_err(|e| CarelinkError::Store(StoreError::from(e)))?;
                Ok(Some(claim.owner_account_id))
            }
            None => Ok(None),
        }
    }
}

pub(crate) fn log_claim(normalized_email: &str, candidate: &str, result: &ClaimResult) {
    match result {
        ClaimResult::Claimed => info!(account_id = %candidate, "Email claimed"),
        ClaimResult::AlreadyOwned => info!(account_id = %candidate, "Email already owned by caller"),
        ClaimResult::Reclaimed { previous_owner } => warn!(
            account_id = %candidate,
            previous_owner = %previous_owner,
            "Reclaimed orphaned email claim"
        ),
        ClaimResult::Conflict { owner } => warn!(
            email = %normalized_email,
            owner = %owner,
            "Email claim conflict"
        ),
    }
}
