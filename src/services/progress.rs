//! Assignment Progress Tracker
//!
//! Completing a session first appends the session record, then advances the
//! assignment by a fixed increment in its own transaction. History is written
//! before the derived progress so a failure in between only loses the bump.
//! Concurrent completions conflict in the store and retry against a fresh
//! read, so no increment is lost.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::clock::Clock;
use super::context::OpContext;
use super::retry::{CallerCredentials, RetryPolicy};
use crate::db::schemas::{
    AccountDoc, AssignmentDoc, AuditEntryDoc, AuditEvent, Role, SessionDoc, SessionPayload,
};
use crate::db::{transact, Collection, DocKey, DocumentStore, StoreError, TxnStep, WriteSet};
use crate::types::{CarelinkError, Result};

/// Result of recording a completed session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub session_id: String,
    /// The updated assignment; `None` when it does not exist
    pub assignment: Option<AssignmentDoc>,
}

enum CreateTxn {
    Created(AssignmentDoc),
    NoManager,
    NotAManager(Role),
    NotLinked,
}

#[derive(Clone)]
pub struct AssignmentProgressTracker {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    increment: u8,
}

impl AssignmentProgressTracker {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        increment: u8,
    ) -> Self {
        Self {
            store,
            clock,
            retry,
            increment,
        }
    }

    /// Assign an activity to a dependent linked to `manager_account_id`
    pub async fn create_assignment(
        &self,
        ctx: &OpContext,
        manager_account_id: &str,
        dependent_account_id: &str,
        activity_template_id: &str,
        scheduled_sessions: u32,
        credentials: Option<CallerCredentials<'_>>,
    ) -> Result<AssignmentDoc> {
        if activity_template_id.trim().is_empty() {
            return Err(CarelinkError::Validation(
                "activity_template_id is required".into(),
            ));
        }

        let assignment_id = uuid::Uuid::new_v4().to_string();
        let manager_key = DocKey::account(manager_account_id);
        let dependent_key = DocKey::account(dependent_account_id);
        let assignment_key = DocKey::assignment(&assignment_id);
        let keys = [manager_key.clone(), dependent_key.clone(), assignment_key.clone()];
        let store = self.store.as_ref();

        let outcome = self
            .retry
            .run(ctx, "assignment_create", credentials, || {
                transact(store, &keys, |snap| {
                    let Some(manager) = snap.decode::<AccountDoc>(&manager_key)? else {
                        return Ok(TxnStep::Abort(CreateTxn::NoManager));
                    };
                    if manager.role != Role::Manager {
                        return Ok(TxnStep::Abort(CreateTxn::NotAManager(manager.role)));
                    }

                    let linked = snap
                        .decode::<AccountDoc>(&dependent_key)?
                        .map(|d| {
                            d.role == Role::Dependent
                                && d.manager_id.as_deref() == Some(manager_account_id)
                        })
                        .unwrap_or(false);
                    if !linked {
                        return Ok(TxnStep::Abort(CreateTxn::NotLinked));
                    }

                    let assignment = AssignmentDoc::new(
                        assignment_id.clone(),
                        dependent_account_id.to_string(),
                        activity_template_id.to_string(),
                        manager_account_id.to_string(),
                        scheduled_sessions,
                        self.clock.now(),
                    );
                    let mut writes = WriteSet::new();
                    writes.put(assignment_key.clone(), &assignment)?;
                    Ok(TxnStep::Commit(writes, CreateTxn::Created(assignment)))
                })
            })
            .await?;

        match outcome {
            CreateTxn::Created(assignment) => {
                info!(
                    assignment_id = %assignment.id,
                    dependent = %dependent_account_id,
                    manager = %manager_account_id,
                    "Assignment created"
                );
                Ok(assignment)
            }
            CreateTxn::NoManager => Err(CarelinkError::ProfileMissing(manager_account_id.to_string())),
            CreateTxn::NotAManager(actual) => Err(CarelinkError::RoleMismatch {
                account_id: manager_account_id.to_string(),
                expected: Role::Manager,
                actual: Some(actual),
            }),
            CreateTxn::NotLinked => Err(CarelinkError::NotLinked {
                dependent: dependent_account_id.to_string(),
                manager: manager_account_id.to_string(),
            }),
        }
    }

    /// Record a completed session and advance its assignment.
    ///
    /// A missing assignment is not an error: the session is kept and the
    /// completion carries no assignment.
    pub async fn record_completion(
        &self,
        ctx: &OpContext,
        assignment_id: &str,
        payload: SessionPayload,
        recorded_by: Option<&str>,
        credentials: Option<CallerCredentials<'_>>,
    ) -> Result<Completion> {
        payload.validate().map_err(CarelinkError::Validation)?;

        let session = SessionDoc {
            assignment_id: assignment_id.to_string(),
            recorded_by: recorded_by.map(str::to_string),
            payload,
            recorded_at: self.clock.now(),
        };
        let body = serde_json::to_value(&session)
            .map_err(|e| CarelinkError::Store(StoreError::from(e)))?;
        let store = self.store.as_ref();

        let session_id = self
            .retry
            .run(ctx, "session_append", credentials, || {
                store.append(Collection::Sessions, body.clone())
            })
            .await?;

        let key = DocKey::assignment(assignment_id);
        let increment = self.increment;
        let assignment = self
            .retry
            .run(ctx, "assignment_progress", credentials, || {
                transact(store, std::slice::from_ref(&key), |snap| {
                    let Some(mut assignment) = snap.decode::<AssignmentDoc>(&key)? else {
                        return Ok(TxnStep::Abort(None));
                    };
                    assignment.advance(increment, self.clock.now());
                    let mut writes = WriteSet::new();
                    writes.put(key.clone(), &assignment)?;
                    Ok(TxnStep::Commit(writes, Some(assignment)))
                })
            })
            .await?;

        match &assignment {
            Some(a) => info!(
                assignment_id = %a.id,
                session_id = %session_id,
                progress = a.progress,
                state = ?a.state,
                "Assignment progress advanced"
            ),
            None => warn!(
                assignment_id = %assignment_id,
                session_id = %session_id,
                "Session recorded for unknown assignment"
            ),
        }

        self.audit(ctx, &session_id, assignment_id, recorded_by, assignment.as_ref())
            .await;

        Ok(Completion {
            session_id,
            assignment,
        })
    }

    pub async fn get_assignment(&self, ctx: &OpContext, assignment_id: &str) -> Result<AssignmentDoc> {
        let key = DocKey::assignment(assignment_id);
        let store = self.store.as_ref();
        let doc = self
            .retry
            .run(ctx, "assignment_read", None, || store.get(&key))
            .await?
            .ok_or_else(|| CarelinkError::AssignmentNotFound(assignment_id.to_string()))?;

        serde_json::from_value(doc.body).map_err(|e| CarelinkError::Store(StoreError::from(e)))
    }

    /// Best-effort audit entry; failures are logged and dropped
    async fn audit(
        &self,
        ctx: &OpContext,
        session_id: &str,
        assignment_id: &str,
        actor: Option<&str>,
        assignment: Option<&AssignmentDoc>,
    ) {
        let entry = AuditEntryDoc {
            event: AuditEvent::SessionRecorded {
                session_id: session_id.to_string(),
                assignment_id: assignment_id.to_string(),
                progress: assignment.map(|a| a.progress),
            },
            actor_account_id: actor.map(str::to_string),
            at: self.clock.now(),
        };

        let body = match serde_json::to_value(&entry) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Could not encode audit entry");
                return;
            }
        };

        match ctx.guard(self.store.append(Collection::AuditLog, body)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(session_id = %session_id, error = %e, "Audit append failed"),
            Err(e) => warn!(session_id = %session_id, error = %e, "Audit append abandoned"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schemas::{AccountStatus, AssignmentState, Metadata, ProfileFields, SignInMethod};
    use crate::db::MemoryStore;
    use crate::services::clock::SystemClock;
    use chrono::Utc;
    use std::time::Duration;

    fn tracker(store: Arc<MemoryStore>) -> AssignmentProgressTracker {
        AssignmentProgressTracker::new(
            store,
            Arc::new(SystemClock),
            RetryPolicy {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
                jitter: 0.0,
                ..RetryPolicy::default()
            },
            20,
        )
    }

    fn account(id: &str, role: Role, manager_id: Option<&str>) -> AccountDoc {
        AccountDoc {
            id: id.into(),
            email: format!("{id}@example.com"),
            normalized_email: format!("{id}@example.com"),
            role,
            status: AccountStatus::Active,
            sign_in_method: SignInMethod::Password,
            profile: ProfileFields::default(),
            manager_id: manager_id.map(str::to_string),
            metadata: Metadata::new(Utc::now()),
        }
    }

    fn payload() -> SessionPayload {
        SessionPayload {
            duration_minutes: 25,
            perceived_effort: 4,
            feedback: Some("felt fine".into()),
        }
    }

    #[tokio::test]
    async fn test_create_requires_link() {
        let store = Arc::new(MemoryStore::new());
        store.seed(&DocKey::account("mgr"), &account("mgr", Role::Manager, None)).unwrap();
        store.seed(&DocKey::account("dep"), &account("dep", Role::Dependent, None)).unwrap();
        let tracker = tracker(store.clone());
        let ctx = OpContext::new();

        let err = tracker
            .create_assignment(&ctx, "mgr", "dep", "stretching", 5, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CarelinkError::NotLinked { .. }));

        store
            .seed(&DocKey::account("dep"), &account("dep", Role::Dependent, Some("mgr")))
            .unwrap();
        let assignment = tracker
            .create_assignment(&ctx, "mgr", "dep", "stretching", 5, None)
            .await
            .unwrap();
        assert_eq!(assignment.progress, 0);
        assert_eq!(assignment.state, AssignmentState::Assigned);
    }

    #[tokio::test]
    async fn test_completion_advances_progress() {
        let store = Arc::new(MemoryStore::new());
        let assignment =
            AssignmentDoc::new("a1".into(), "dep".into(), "tpl".into(), "mgr".into(), 5, Utc::now());
        store.seed(&DocKey::assignment("a1"), &assignment).unwrap();

        let done = tracker(store.clone())
            .record_completion(&OpContext::new(), "a1", payload(), Some("dep"), None)
            .await
            .unwrap();

        let updated = done.assignment.unwrap();
        assert_eq!(updated.progress, 20);
        assert_eq!(updated.state, AssignmentState::InProgress);
        assert_eq!(store.ids(Collection::Sessions).unwrap(), vec![done.session_id]);
        assert_eq!(store.ids(Collection::AuditLog).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_assignment_keeps_session() {
        let store = Arc::new(MemoryStore::new());
        let done = tracker(store.clone())
            .record_completion(&OpContext::new(), "nope", payload(), None, None)
            .await
            .unwrap();

        assert!(done.assignment.is_none());
        assert_eq!(store.ids(Collection::Sessions).unwrap().len(), 1);

        let err = tracker(store)
            .get_assignment(&OpContext::new(), "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, CarelinkError::AssignmentNotFound(_)));
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_fail_completion() {
        let store = Arc::new(MemoryStore::new());
        let assignment =
            AssignmentDoc::new("a1".into(), "dep".into(), "tpl".into(), "mgr".into(), 5, Utc::now());
        store.seed(&DocKey::assignment("a1"), &assignment).unwrap();
        store
            .fail_next_appends(Collection::AuditLog, StoreError::Backend("audit down".into()), 1)
            .unwrap();

        let done = tracker(store.clone())
            .record_completion(&OpContext::new(), "a1", payload(), None, None)
            .await
            .unwrap();

        assert_eq!(done.assignment.unwrap().progress, 20);
        assert_eq!(store.ids(Collection::Sessions).unwrap().len(), 1);
        assert!(store.ids(Collection::AuditLog).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_append_is_retried() {
        let store = Arc::new(MemoryStore::new());
        store
            .fail_next_appends(Collection::Sessions, StoreError::Unavailable("blip".into()), 2)
            .unwrap();

        let done = tracker(store.clone())
            .record_completion(&OpContext::new(), "a1", payload(), None, None)
            .await
            .unwrap();
        assert_eq!(store.ids(Collection::Sessions).unwrap(), vec![done.session_id]);
    }

    #[tokio::test]
    async fn test_invalid_payload_records_nothing() {
        let store = Arc::new(MemoryStore::new());
        let err = tracker(store.clone())
            .record_completion(
                &OpContext::new(),
                "a1",
                SessionPayload {
                    duration_minutes: 10,
                    perceived_effort: 0,
                    feedback: None,
                },
                None,
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CarelinkError::Validation(_)));
        assert!(store.ids(Collection::Sessions).unwrap().is_empty());
    }
}
