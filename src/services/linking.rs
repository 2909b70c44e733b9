//! Linking Code Service
//!
//! A dependent mints a short code (`XXXX-XXXX`, unambiguous alphabet) and
//! reads it to their manager; the manager redeems it once to link the two
//! accounts. Only the SHA-256 digest of a code is stored.
//!
//! Redemption marks the code used, points the dependent at the manager and
//! writes the manager's roster entry in one transaction. Two managers racing
//! on one code conflict in the store; the loser re-reads a used code and gets
//! [`CarelinkError::InvalidOrExpiredCode`]. Every redemption of an existing
//! code, accepted or not, bumps its attempt count in the same transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info};

use super::clock::Clock;
use super::context::OpContext;
use super::notify::{Notification, Notifier};
use super::retry::{CallerCredentials, RetryPolicy};
use crate::db::schemas::{
    digest_code, AccountDoc, LinkingCodeDoc, RosterEntryDoc, Role, CODE_ALPHABET, CODE_GROUP_LEN,
};
use crate::db::{transact, DocKey, DocumentStore, StoreError, TxnStep, WriteSet};
use crate::types::{CarelinkError, Result};

/// Fresh codes tried before giving up on digest collisions
const MAX_GENERATE_ATTEMPTS: u32 = 5;

/// Produces plaintext linking codes
pub trait CodeSource: Send + Sync {
    fn next_code(&self) -> String;
}

/// Codes drawn uniformly from [`CODE_ALPHABET`] with the OS RNG
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomCodeSource;

impl CodeSource for RandomCodeSource {
    fn next_code(&self) -> String {
        let mut rng = OsRng;
        let mut code = String::with_capacity(CODE_GROUP_LEN * 2 + 1);
        for i in 0..CODE_GROUP_LEN * 2 {
            if i == CODE_GROUP_LEN {
                code.push('-');
            }
            let idx = rng.gen_range(0..CODE_ALPHABET.len());
            code.push(CODE_ALPHABET[idx] as char);
        }
        code
    }
}

/// A code handed to its dependent; the plaintext is not recoverable later
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedCode {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

/// A link established by redeeming a code
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkResult {
    pub dependent_account_id: String,
    pub manager_account_id: String,
    pub linked_at: DateTime<Utc>,
    /// Manager the dependent was linked to before, if any
    pub previous_manager_id: Option<String>,
}

enum GenerateTxn {
    Created(DateTime<Utc>),
    Collision,
    NoAccount,
    WrongRole(Role),
    Disabled,
}

enum RedeemTxn {
    Linked(LinkResult),
    Invalid,
    NoManager,
    NotAManager(Role),
    ManagerDisabled,
}

/// Turn down a redemption of an existing code, keeping its attempt count
fn rejected(
    code_key: &DocKey,
    code: &LinkingCodeDoc,
    reason: RedeemTxn,
) -> std::result::Result<TxnStep<RedeemTxn>, StoreError> {
    let mut writes = WriteSet::new();
    writes.put(code_key.clone(), code)?;
    Ok(TxnStep::Commit(writes, reason))
}

#[derive(Clone)]
pub struct LinkingCodeService {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    codes: Arc<dyn CodeSource>,
    retry: RetryPolicy,
    ttl: chrono::Duration,
}

impl LinkingCodeService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        codes: Arc<dyn CodeSource>,
        retry: RetryPolicy,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
            codes,
            retry,
            ttl,
        }
    }

    /// Mint a code for `dependent_account_id`.
    ///
    /// Earlier unexpired codes stay valid.
    pub async fn generate(
        &self,
        ctx: &OpContext,
        dependent_account_id: &str,
        credentials: Option<CallerCredentials<'_>>,
    ) -> Result<GeneratedCode> {
        let account_key = DocKey::account(dependent_account_id);
        let store = self.store.as_ref();

        for attempt in 1..=MAX_GENERATE_ATTEMPTS {
            let code = self.codes.next_code();
            let digest = digest_code(&code);
            let code_key = DocKey::linking_code(&digest);
            let keys = [account_key.clone(), code_key.clone()];

            let outcome = self
                .retry
                .run(ctx, "linking_code_generate", credentials, || {
                    transact(store, &keys, |snap| {
                        let Some(account) = snap.decode::<AccountDoc>(&account_key)? else {
                            return Ok(TxnStep::Abort(GenerateTxn::NoAccount));
                        };
                        if account.role != Role::Dependent {
                            return Ok(TxnStep::Abort(GenerateTxn::WrongRole(account.role)));
                        }
                        if !account.is_enabled() {
                            return Ok(TxnStep::Abort(GenerateTxn::Disabled));
                        }
                        if snap.exists(&code_key) {
                            return Ok(TxnStep::Abort(GenerateTxn::Collision));
                        }

                        let doc = LinkingCodeDoc::new(
                            digest.clone(),
                            dependent_account_id.to_string(),
                            self.clock.now(),
                            self.ttl,
                        );
                        let expires_at = doc.expires_at;
                        let mut writes = WriteSet::new();
                        writes.put(code_key.clone(), &doc)?;
                        Ok(TxnStep::Commit(writes, GenerateTxn::Created(expires_at)))
                    })
                })
                .await?;

            match outcome {
                GenerateTxn::Created(expires_at) => {
                    info!(
                        dependent = %dependent_account_id,
                        expires_at = %expires_at,
                        "Linking code generated"
                    );
                    return Ok(GeneratedCode { code, expires_at });
                }
                GenerateTxn::Collision => {
                    debug!(attempt, "Linking code digest already taken, drawing another");
                }
                GenerateTxn::NoAccount => {
                    return Err(CarelinkError::ProfileMissing(dependent_account_id.to_string()))
                }
                GenerateTxn::WrongRole(actual) => {
                    return Err(CarelinkError::RoleMismatch {
                        account_id: dependent_account_id.to_string(),
                        expected: Role::Dependent,
                        actual: Some(actual),
                    })
                }
                GenerateTxn::Disabled => {
                    return Err(CarelinkError::AccountDisabled(dependent_account_id.to_string()))
                }
            }
        }

        Err(CarelinkError::Internal(
            "Could not allocate a unique linking code".into(),
        ))
    }

    /// Redeem `code` for `manager_account_id`.
    ///
    /// Unknown, used and expired codes all fail the same way.
    pub async fn redeem(
        &self,
        ctx: &OpContext,
        code: &str,
        manager_account_id: &str,
        credentials: Option<CallerCredentials<'_>>,
    ) -> Result<LinkResult> {
        let digest = digest_code(code);
        let code_key = DocKey::linking_code(&digest);
        let manager_key = DocKey::account(manager_account_id);
        let keys = [code_key.clone(), manager_key.clone()];
        let store = self.store.as_ref();

        let outcome = self
            .retry
            .run(ctx, "linking_code_redeem", credentials, || {
                transact(store, &keys, |snap| {
                    let now = self.clock.now();

                    let Some(mut link_code) = snap.decode::<LinkingCodeDoc>(&code_key)? else {
                        return Ok(TxnStep::Abort(RedeemTxn::Invalid));
                    };
                    link_code.record_attempt();
                    if !link_code.is_redeemable(now) {
                        return rejected(&code_key, &link_code, RedeemTxn::Invalid);
                    }

                    let Some(manager) = snap.decode::<AccountDoc>(&manager_key)? else {
                        return rejected(&code_key, &link_code, RedeemTxn::NoManager);
                    };
                    if manager.role != Role::Manager {
                        return rejected(&code_key, &link_code, RedeemTxn::NotAManager(manager.role));
                    }
                    if !manager.is_enabled() {
                        return rejected(&code_key, &link_code, RedeemTxn::ManagerDisabled);
                    }

                    let dependent_id = link_code.owner_account_id.clone();
                    let dependent_key = DocKey::account(&dependent_id);
                    let roster_key = DocKey::roster(manager_account_id, &dependent_id);
                    let missing: Vec<DocKey> = [dependent_key.clone(), roster_key.clone()]
                        .into_iter()
                        .filter(|k| !snap.covers(k))
                        .collect();
                    if !missing.is_empty() {
                        return Ok(TxnStep::Expand(missing));
                    }

                    let Some(mut dependent) = snap.decode::<AccountDoc>(&dependent_key)? else {
                        return rejected(&code_key, &link_code, RedeemTxn::Invalid);
                    };
                    if dependent.role != Role::Dependent {
                        return rejected(&code_key, &link_code, RedeemTxn::Invalid);
                    }

                    let previous = dependent
                        .manager_id
                        .clone()
                        .filter(|prev| prev != manager_account_id);
                    let previous_roster_key =
                        previous.as_deref().map(|prev| DocKey::roster(prev, &dependent_id));
                    if let Some(key) = &previous_roster_key {
                        if !snap.covers(key) {
                            return Ok(TxnStep::Expand(vec![key.clone()]));
                        }
                    }

                    let mut writes = WriteSet::new();

                    link_code.mark_used(manager_account_id, now);
                    writes.put(code_key.clone(), &link_code)?;

                    dependent.manager_id = Some(manager_account_id.to_string());
                    dependent.metadata.touch(now);
                    writes.put(dependent_key, &dependent)?;

                    let entry = RosterEntryDoc {
                        manager_account_id: manager_account_id.to_string(),
                        dependent_account_id: dependent_id.clone(),
                        linked_at: now,
                        code_digest: link_code.code_digest.clone(),
                        unlinked_at: None,
                    };
                    writes.put(roster_key, &entry)?;

                    if let Some(key) = previous_roster_key {
                        if let Some(mut old) = snap.decode::<RosterEntryDoc>(&key)? {
                            old.unlinked_at = Some(now);
                            writes.put(key, &old)?;
                        }
                    }

                    Ok(TxnStep::Commit(
                        writes,
                        RedeemTxn::Linked(LinkResult {
                            dependent_account_id: dependent_id,
                            manager_account_id: manager_account_id.to_string(),
                            linked_at: now,
                            previous_manager_id: previous,
                        }),
                    ))
                })
            })
            .await?;

        match outcome {
            RedeemTxn::Linked(link) => {
                info!(
                    dependent = %link.dependent_account_id,
                    manager = %link.manager_account_id,
                    relinked = link.previous_manager_id.is_some(),
                    "Linking code redeemed"
                );
                self.notifier.notify(Notification::ManagerLinked {
                    dependent_account_id: link.dependent_account_id.clone(),
                    manager_account_id: link.manager_account_id.clone(),
                });
                Ok(link)
            }
            RedeemTxn::Invalid => {
                debug!(manager = %manager_account_id, "Rejected linking code");
                Err(CarelinkError::InvalidOrExpiredCode)
            }
            RedeemTxn::NoManager => Err(CarelinkError::ProfileMissing(manager_account_id.to_string())),
            RedeemTxn::NotAManager(actual) => Err(CarelinkError::RoleMismatch {
                account_id: manager_account_id.to_string(),
                expected: Role::Manager,
                actual: Some(actual),
            }),
            RedeemTxn::ManagerDisabled => {
                Err(CarelinkError::AccountDisabled(manager_account_id.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schemas::{normalize_code, AccountStatus, Metadata, ProfileFields, SignInMethod};
    use crate::db::MemoryStore;
    use crate::services::clock::ManualClock;
    use crate::services::notify::MemoryNotifier;
    use chrono::TimeZone;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Hands out a fixed sequence of codes
    struct ScriptedCodes(Mutex<Vec<&'static str>>);

    impl CodeSource for ScriptedCodes {
        fn next_code(&self) -> String {
            let mut codes = self.0.lock().unwrap();
            codes.remove(0).to_string()
        }
    }

    fn account(id: &str, role: Role) -> AccountDoc {
        AccountDoc {
            id: id.into(),
            email: format!("{id}@example.com"),
            normalized_email: format!("{id}@example.com"),
            role,
            status: AccountStatus::Active,
            sign_in_method: SignInMethod::Password,
            profile: ProfileFields::default(),
            manager_id: None,
            metadata: Metadata::new(Utc::now()),
        }
    }

    fn service(
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        codes: Vec<&'static str>,
    ) -> LinkingCodeService {
        LinkingCodeService::new(
            store,
            clock,
            Arc::new(MemoryNotifier::new()),
            Arc::new(ScriptedCodes(Mutex::new(codes))),
            RetryPolicy {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
                jitter: 0.0,
                ..RetryPolicy::default()
            },
            chrono::Duration::hours(24),
        )
    }

    fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.seed(&DocKey::account("dep"), &account("dep", Role::Dependent)).unwrap();
        store.seed(&DocKey::account("mgr"), &account("mgr", Role::Manager)).unwrap();
        store.seed(&DocKey::account("mgr2"), &account("mgr2", Role::Manager)).unwrap();
        store
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap()))
    }

    #[test]
    fn test_random_codes_are_well_formed() {
        for _ in 0..100 {
            let code = RandomCodeSource.next_code();
            assert_eq!(code.len(), 9);
            assert_eq!(&code[4..5], "-");
            assert!(code
                .bytes()
                .filter(|b| *b != b'-')
                .all(|b| CODE_ALPHABET.contains(&b)));
            assert_eq!(normalize_code(&code), code);
        }
    }

    #[tokio::test]
    async fn test_only_digest_is_stored() {
        let store = seeded_store();
        let svc = service(store.clone(), clock(), vec!["ABCD-EFGH"]);

        let generated = svc.generate(&OpContext::new(), "dep", None).await.unwrap();
        assert_eq!(generated.code, "ABCD-EFGH");

        let ids = store.ids(crate::db::Collection::LinkingCodes).unwrap();
        assert_eq!(ids, vec![digest_code("ABCD-EFGH")]);
        let doc: LinkingCodeDoc = store.read(&DocKey::linking_code(&ids[0])).unwrap().unwrap();
        assert!(!doc.used);
        assert_eq!(doc.expires_at, doc.created_at + chrono::Duration::hours(24));
    }

    #[tokio::test]
    async fn test_managers_cannot_generate() {
        let svc = service(seeded_store(), clock(), vec!["ABCD-EFGH"]);
        let err = svc.generate(&OpContext::new(), "mgr", None).await.unwrap_err();
        assert!(matches!(err, CarelinkError::RoleMismatch { .. }));
    }

    #[tokio::test]
    async fn test_collision_draws_another_code() {
        let svc = service(seeded_store(), clock(), vec!["AAAA-AAAA", "AAAA-AAAA", "BBBB-BBBB"]);
        let ctx = OpContext::new();

        assert_eq!(svc.generate(&ctx, "dep", None).await.unwrap().code, "AAAA-AAAA");
        assert_eq!(svc.generate(&ctx, "dep", None).await.unwrap().code, "BBBB-BBBB");
    }

    #[tokio::test]
    async fn test_redeem_links_both_sides() {
        let store = seeded_store();
        let svc = service(store.clone(), clock(), vec!["ABCD-EFGH"]);
        let ctx = OpContext::new();
        svc.generate(&ctx, "dep", None).await.unwrap();

        let link = svc.redeem(&ctx, " abcd-efgh ", "mgr", None).await.unwrap();
        assert_eq!(link.dependent_account_id, "dep");
        assert_eq!(link.previous_manager_id, None);

        let dependent: AccountDoc = store.read(&DocKey::account("dep")).unwrap().unwrap();
        assert_eq!(dependent.manager_id.as_deref(), Some("mgr"));
        let roster: RosterEntryDoc = store.read(&DocKey::roster("mgr", "dep")).unwrap().unwrap();
        assert!(roster.is_active());
    }

    #[tokio::test]
    async fn test_dependent_cannot_redeem() {
        let store = seeded_store();
        let svc = service(store.clone(), clock(), vec!["ABCD-EFGH"]);
        let ctx = OpContext::new();
        svc.generate(&ctx, "dep", None).await.unwrap();

        let err = svc.redeem(&ctx, "ABCD-EFGH", "dep", None).await.unwrap_err();
        assert!(matches!(err, CarelinkError::RoleMismatch { .. }));

        // The code is still redeemable by a manager
        assert!(svc.redeem(&ctx, "ABCD-EFGH", "mgr", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_relinking_retires_previous_roster_entry() {
        let store = seeded_store();
        let svc = service(store.clone(), clock(), vec!["AAAA-BBBB", "CCCC-DDDD"]);
        let ctx = OpContext::new();

        svc.generate(&ctx, "dep", None).await.unwrap();
        svc.redeem(&ctx, "AAAA-BBBB", "mgr", None).await.unwrap();
        svc.generate(&ctx, "dep", None).await.unwrap();
        let link = svc.redeem(&ctx, "CCCC-DDDD", "mgr2", None).await.unwrap();

        assert_eq!(link.previous_manager_id.as_deref(), Some("mgr"));
        let old: RosterEntryDoc = store.read(&DocKey::roster("mgr", "dep")).unwrap().unwrap();
        assert!(!old.is_active());
        let dependent: AccountDoc = store.read(&DocKey::account("dep")).unwrap().unwrap();
        assert_eq!(dependent.manager_id.as_deref(), Some("mgr2"));
    }
}
