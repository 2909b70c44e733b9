//! Account Reconciler
//!
//! Creates exactly one account per signup and keeps it consistent with the
//! email claim ledger. Both signup paths (password and federated) end in the
//! same transaction: decide the claim, then write the claim and the account
//! document together, or neither.
//!
//! Whenever the application-level account cannot be established after the
//! provider identity was authenticated, the provider session is signed out so
//! the caller is never left authenticated without a profile. The provider
//! identity itself is not deleted.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::context::OpContext;
use super::ledger::{log_claim, ClaimPlan, ClaimResult, EmailClaimLedger};
use super::notify::{Notification, Notifier};
use super::retry::{CallerCredentials, RetryPolicy};
use crate::db::schemas::{
    normalize_email, AccountDoc, AccountStatus, Metadata, ProfileFields, Role, SignInMethod,
};
use crate::db::{transact, DocKey, DocumentStore, StoreError, TxnStep, WriteSet};
use crate::gateway::{CredentialGateway, GatewayError, ProviderSession};
use crate::types::{CarelinkError, Result};

/// An account together with the provider session that proves it
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedAccount {
    pub account: AccountDoc,
    pub session: ProviderSession,
}

/// Inputs a federated caller needs to finish signing up
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingFederatedSignup {
    pub session: ProviderSession,
    pub session_account_id: String,
    pub claimed_email: String,
    pub display_name: Option<String>,
    pub role: Role,
}

/// Result of a federated sign-in attempt
#[derive(Debug, Clone)]
pub enum FederatedSignIn {
    /// The caller already has an account
    Existing(AuthenticatedAccount),
    /// Authenticated, but no account yet; finish with `complete_federated_signup`
    NeedsProfile(PendingFederatedSignup),
}

/// What the signup transaction decided
enum SignupTxn {
    Established { account: AccountDoc, claim: ClaimResult },
    EmailTaken { owner: String },
    RoleTaken(Role),
    EmailMismatch(String),
}

/// What the verification transaction found
enum VerifyTxn {
    Verified(AccountDoc),
    Unchanged(AccountDoc),
    Missing,
    EmailChanged,
}

/// What a read-only federated lookup found
enum FederatedLookup {
    Account(AccountDoc),
    Unclaimed,
    EmailTaken { owner: String },
}

#[derive(Clone)]
pub struct AccountReconciler {
    store: Arc<dyn DocumentStore>,
    gateway: Arc<dyn CredentialGateway>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
}

impl AccountReconciler {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        gateway: Arc<dyn CredentialGateway>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            gateway,
            clock,
            notifier,
            retry,
        }
    }

    /// Sign up with email and password.
    ///
    /// The account starts out pending verification and a verification email
    /// is queued. Resubmitting with the same email and password resumes an
    /// earlier attempt: it merges into the account if one was written, and
    /// creates it if the earlier attempt stopped after the provider identity.
    pub async fn signup_direct(
        &self,
        ctx: &OpContext,
        email: &str,
        password: &str,
        role: Role,
        profile: ProfileFields,
    ) -> Result<AuthenticatedAccount> {
        let normalized = normalized_or_err(email)?;
        profile
            .validate_for(role)
            .map_err(CarelinkError::Validation)?;

        let session = match ctx
            .guard(self.gateway.create_account_with_password(email, password))
            .await?
        {
            Ok(session) => session,
            Err(GatewayError::EmailInUse) => {
                self.resume_password_signup(ctx, email, password, &normalized)
                    .await?
            }
            Err(other) => return Err(CarelinkError::Credential(other)),
        };

        let outcome = async {
            let session = self.refreshed(ctx, &session).await?;
            let (account, claim) = self
                .establish(
                    ctx,
                    &session,
                    &normalized,
                    role,
                    &profile,
                    SignInMethod::Password,
                    AccountStatus::PendingVerification,
                )
                .await?;
            Ok::<_, CarelinkError>((account, claim, session))
        }
        .await;

        let (account, claim, session) = match outcome {
            Ok(done) => done,
            Err(e) => {
                self.unwind(&session).await;
                return Err(e);
            }
        };

        if claim != ClaimResult::AlreadyOwned {
            if let Err(e) = self.send_verification(ctx, &account).await {
                warn!(account_id = %account.id, error = %e, "Could not queue verification email");
            }
        }

        Ok(AuthenticatedAccount { account, session })
    }

    /// A provider identity already holds the address. Holding its password
    /// makes this a retry; anything else means the address is someone else's.
    async fn resume_password_signup(
        &self,
        ctx: &OpContext,
        email: &str,
        password: &str,
        normalized: &str,
    ) -> Result<ProviderSession> {
        match ctx
            .guard(self.gateway.sign_in_with_password(email, password))
            .await?
        {
            Ok(session) => {
                info!(account_id = %session.account_id, "Resuming earlier signup");
                Ok(session)
            }
            Err(GatewayError::WrongPassword | GatewayError::UserNotFound) => {
                Err(CarelinkError::EmailAlreadyRegistered {
                    email: normalized.to_string(),
                })
            }
            Err(other) => Err(CarelinkError::Credential(other)),
        }
    }

    /// Finish signing up a caller already authenticated through a federated
    /// provider.
    ///
    /// `session_account_id` and `claimed_email` come from the client and are
    /// checked against what the provider token actually proves.
    pub async fn complete_federated_signup(
        &self,
        ctx: &OpContext,
        session: &ProviderSession,
        session_account_id: &str,
        claimed_email: &str,
        role: Role,
        profile: ProfileFields,
    ) -> Result<AuthenticatedAccount> {
        let normalized = normalized_or_err(claimed_email)?;
        profile
            .validate_for(role)
            .map_err(CarelinkError::Validation)?;

        let session = self.refreshed(ctx, session).await?;
        let identity = ctx
            .guard(self.gateway.verify_credential(&session.token))
            .await??;

        if identity.account_id != session_account_id {
            warn!(
                claimed = %session_account_id,
                actual = %identity.account_id,
                "Federated signup for a different account"
            );
            return Err(CarelinkError::IdentityMismatch {
                expected: session_account_id.to_string(),
                actual: identity.account_id,
            });
        }
        if normalize_email(&identity.email).as_deref() != Some(normalized.as_str()) {
            return Err(CarelinkError::IdentityMismatch {
                expected: identity.email,
                actual: normalized,
            });
        }

        match self
            .establish(
                ctx,
                &session,
                &normalized,
                role,
                &profile,
                SignInMethod::Federated,
                AccountStatus::Active,
            )
            .await
        {
            Ok((account, _)) => Ok(AuthenticatedAccount { account, session }),
            Err(e @ CarelinkError::EmailAlreadyRegistered { .. }) => {
                self.unwind(&session).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Password sign-in for a portal.
    ///
    /// Signs the provider session back out when the account is missing,
    /// belongs to the other portal or is disabled.
    pub async fn sign_in(
        &self,
        ctx: &OpContext,
        email: &str,
        password: &str,
        expected_role: Role,
    ) -> Result<AuthenticatedAccount> {
        let session = ctx
            .guard(self.gateway.sign_in_with_password(email, password))
            .await??;

        match self.admit(ctx, &session, expected_role).await {
            Ok(signed_in) => Ok(signed_in),
            Err(e) => {
                self.unwind(&session).await;
                Err(e)
            }
        }
    }

    /// Federated sign-in for a portal, falling back to the redirect flow when
    /// the popup is closed or blocked.
    pub async fn begin_federated(
        &self,
        ctx: &OpContext,
        expected_role: Role,
    ) -> Result<FederatedSignIn> {
        let session = match ctx.guard(self.gateway.begin_federated_sign_in()).await? {
            Ok(session) => session,
            Err(e) if e.wants_redirect_fallback() => {
                info!(reason = %e, "Popup sign-in failed, using redirect result");
                match ctx.guard(self.gateway.federated_redirect_result()).await?? {
                    Some(session) => session,
                    None => return Err(CarelinkError::Credential(e)),
                }
            }
            Err(e) => return Err(CarelinkError::Credential(e)),
        };

        match self.resolve_federated(ctx, session.clone(), expected_role).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.unwind(&session).await;
                Err(e)
            }
        }
    }

    /// Move a pending account to active, given the code from its
    /// verification email.
    ///
    /// Active accounts are left alone; disabled accounts stay disabled. A code
    /// issued for an address the account no longer has is rejected.
    pub async fn confirm_email_verified(&self, ctx: &OpContext, code: &str) -> Result<AccountDoc> {
        let identity = match ctx.guard(self.gateway.apply_verification_code(code)).await? {
            Ok(identity) => identity,
            Err(GatewayError::InvalidToken(reason)) => {
                debug!(reason = %reason, "Rejected verification code");
                return Err(CarelinkError::InvalidActionCode);
            }
            Err(other) => return Err(CarelinkError::Credential(other)),
        };
        let normalized = normalized_or_err(&identity.email)?;
        let account_id = identity.account_id.as_str();
        let key = DocKey::account(account_id);
        let store = self.store.as_ref();

        let outcome = self
            .retry
            .run(ctx, "account_verify_email", None, || {
                transact(store, std::slice::from_ref(&key), |snap| {
                    let Some(mut account) = snap.decode::<AccountDoc>(&key)? else {
                        return Ok(TxnStep::Abort(VerifyTxn::Missing));
                    };
                    if account.normalized_email != normalized {
                        return Ok(TxnStep::Abort(VerifyTxn::EmailChanged));
                    }
                    if account.status != AccountStatus::PendingVerification {
                        return Ok(TxnStep::Abort(VerifyTxn::Unchanged(account)));
                    }
                    account.status = AccountStatus::Active;
                    account.metadata.touch(self.clock.now());
                    let mut writes = WriteSet::new();
                    writes.put(key.clone(), &account)?;
                    Ok(TxnStep::Commit(writes, VerifyTxn::Verified(account)))
                })
            })
            .await?;

        let account = match outcome {
            VerifyTxn::Verified(account) => {
                info!(account_id = %account.id, "Email verified");
                account
            }
            VerifyTxn::Unchanged(account) => account,
            VerifyTxn::Missing => return Err(CarelinkError::AccountNotFound(account_id.to_string())),
            VerifyTxn::EmailChanged => return Err(CarelinkError::InvalidActionCode),
        };

        if account.status == AccountStatus::Disabled {
            return Err(CarelinkError::AccountDisabled(account.id));
        }
        Ok(account)
    }

    /// Queue a fresh verification email.
    ///
    /// Returns false when the account is already verified.
    pub async fn resend_verification(&self, ctx: &OpContext, account_id: &str) -> Result<bool> {
        let account = self.get_account(ctx, account_id).await?;
        match account.status {
            AccountStatus::Disabled => Err(CarelinkError::AccountDisabled(account.id)),
            AccountStatus::Active => Ok(false),
            AccountStatus::PendingVerification => {
                self.send_verification(ctx, &account).await?;
                Ok(true)
            }
        }
    }

    /// Queue a password-reset email.
    ///
    /// Succeeds silently when no password identity uses the address, so the
    /// caller cannot learn which emails are registered.
    pub async fn request_password_reset(&self, ctx: &OpContext, email: &str) -> Result<()> {
        normalized_or_err(email)?;
        match ctx
            .guard(self.gateway.issue_password_reset_code(email))
            .await?
        {
            Ok((identity, code)) => {
                info!(account_id = %identity.account_id, "Password reset requested");
                self.notifier.notify(Notification::PasswordReset {
                    account_id: identity.account_id,
                    email: identity.email,
                    code,
                });
                Ok(())
            }
            Err(GatewayError::UserNotFound) => {
                debug!("Password reset requested for an address with no password identity");
                Ok(())
            }
            Err(other) => Err(CarelinkError::Credential(other)),
        }
    }

    /// Set a new password using the code from a reset email.
    ///
    /// Every session issued before the reset is revoked.
    pub async fn confirm_password_reset(
        &self,
        ctx: &OpContext,
        code: &str,
        new_password: &str,
    ) -> Result<()> {
        match ctx
            .guard(self.gateway.confirm_password_reset(code, new_password))
            .await?
        {
            Ok(identity) => {
                info!(account_id = %identity.account_id, "Password changed by reset");
                Ok(())
            }
            Err(GatewayError::InvalidToken(reason)) => {
                debug!(reason = %reason, "Rejected reset code");
                Err(CarelinkError::InvalidActionCode)
            }
            Err(other) => Err(CarelinkError::Credential(other)),
        }
    }

    pub async fn get_account(&self, ctx: &OpContext, account_id: &str) -> Result<AccountDoc> {
        self.find_account(ctx, account_id, None)
            .await?
            .ok_or_else(|| CarelinkError::AccountNotFound(account_id.to_string()))
    }

    async fn find_account(
        &self,
        ctx: &OpContext,
        account_id: &str,
        credentials: Option<CallerCredentials<'_>>,
    ) -> Result<Option<AccountDoc>> {
        let key = DocKey::account(account_id);
        let store = self.store.as_ref();
        let doc = self
            .retry
            .run(ctx, "account_read", credentials, || store.get(&key))
            .await?;

        doc.map(|d| serde_json::from_value::<AccountDoc>(d.body))
            .transpose()
            .map_err(|e| CarelinkError::Store(StoreError::from(e)))
    }

    /// Check a freshly authenticated session against its account
    async fn admit(
        &self,
        ctx: &OpContext,
        session: &ProviderSession,
        expected_role: Role,
    ) -> Result<AuthenticatedAccount> {
        let session = self.refreshed(ctx, session).await?;
        let credentials = CallerCredentials {
            gateway: self.gateway.as_ref(),
            session: &session,
        };

        let account = self
            .find_account(ctx, &session.account_id, Some(credentials))
            .await?
            .ok_or_else(|| CarelinkError::ProfileMissing(session.account_id.clone()))?;

        check_admissible(&account, expected_role)?;
        info!(account_id = %account.id, role = ?account.role, "Signed in");
        Ok(AuthenticatedAccount { account, session })
    }

    async fn resolve_federated(
        &self,
        ctx: &OpContext,
        session: ProviderSession,
        expected_role: Role,
    ) -> Result<FederatedSignIn> {
        let normalized = normalized_or_err(&session.email)?;
        let session = self.refreshed(ctx, &session).await?;
        let credentials = CallerCredentials {
            gateway: self.gateway.as_ref(),
            session: &session,
        };

        let account_key = DocKey::account(&session.account_id);
        let claim_key = DocKey::email_claim(&normalized);
        let keys = [account_key.clone(), claim_key];
        let store = self.store.as_ref();

        let lookup = self
            .retry
            .run(ctx, "federated_lookup", Some(credentials), || {
                transact(store, &keys, |snap| {
                    if let Some(account) = snap.decode::<AccountDoc>(&account_key)? {
                        return Ok(TxnStep::Abort(FederatedLookup::Account(account)));
                    }
                    let plan = EmailClaimLedger::plan(
                        snap,
                        &normalized,
                        &session.account_id,
                        self.clock.now(),
                    )?;
                    Ok(match plan {
                        ClaimPlan::NeedKeys(extra) => TxnStep::Expand(extra),
                        ClaimPlan::Decided {
                            result: ClaimResult::Conflict { owner },
                            ..
                        } => TxnStep::Abort(FederatedLookup::EmailTaken { owner }),
                        ClaimPlan::Decided { .. } => TxnStep::Abort(FederatedLookup::Unclaimed),
                    })
                })
            })
            .await?;

        match lookup {
            FederatedLookup::Account(account) => {
                check_admissible(&account, expected_role)?;
                info!(account_id = %account.id, "Federated sign-in for existing account");
                Ok(FederatedSignIn::Existing(AuthenticatedAccount { account, session }))
            }
            FederatedLookup::EmailTaken { owner } => {
                warn!(
                    account_id = %session.account_id,
                    owner = %owner,
                    "Federated identity collides with an existing account"
                );
                Err(CarelinkError::EmailAlreadyRegistered { email: normalized })
            }
            FederatedLookup::Unclaimed => Ok(FederatedSignIn::NeedsProfile(PendingFederatedSignup {
                session_account_id: session.account_id.clone(),
                claimed_email: normalized,
                display_name: session.display_name.clone(),
                role: expected_role,
                session,
            })),
        }
    }

    /// Claim the email and write (or merge into) the account in one transaction
    #[allow(clippy::too_many_arguments)]
    async fn establish(
        &self,
        ctx: &OpContext,
        session: &ProviderSession,
        normalized: &str,
        role: Role,
        profile: &ProfileFields,
        method: SignInMethod,
        initial_status: AccountStatus,
    ) -> Result<(AccountDoc, ClaimResult)> {
        let account_id = session.account_id.as_str();
        let account_key = DocKey::account(account_id);
        let claim_key = DocKey::email_claim(normalized);
        let keys = [claim_key.clone(), account_key.clone()];
        let credentials = CallerCredentials {
            gateway: self.gateway.as_ref(),
            session,
        };
        let store = self.store.as_ref();

        let outcome = self
            .retry
            .run(ctx, "account_signup", Some(credentials), || {
                transact(store, &keys, |snap| {
                    let now = self.clock.now();
                    let (claim, claim_write) =
                        match EmailClaimLedger::plan(snap, normalized, account_id, now)? {
                            ClaimPlan::NeedKeys(extra) => return Ok(TxnStep::Expand(extra)),
                            ClaimPlan::Decided {
                                result: ClaimResult::Conflict { owner },
                                ..
                            } => return Ok(TxnStep::Abort(SignupTxn::EmailTaken { owner })),
                            ClaimPlan::Decided { result, write } => (result, write),
                        };

                    let mut writes = WriteSet::new();
                    if let Some(doc) = &claim_write {
                        writes.put(claim_key.clone(), doc)?;
                    }

                    let account = match snap.decode::<AccountDoc>(&account_key)? {
                        Some(mut existing) => {
                            if existing.role != role {
                                return Ok(TxnStep::Abort(SignupTxn::RoleTaken(existing.role)));
                            }
                            if existing.normalized_email != normalized {
                                return Ok(TxnStep::Abort(SignupTxn::EmailMismatch(
                                    existing.normalized_email,
                                )));
                            }
                            if existing.profile.merge_from(profile) {
                                existing.metadata.touch(now);
                                writes.put(account_key.clone(), &existing)?;
                            }
                            existing
                        }
                        None => {
                            let account = AccountDoc {
                                id: account_id.to_string(),
                                email: session.email.trim().to_string(),
                                normalized_email: normalized.to_string(),
                                role,
                                status: initial_status,
                                sign_in_method: method,
                                profile: profile.clone(),
                                manager_id: None,
                                metadata: Metadata::new(now),
                            };
                            writes.put(account_key.clone(), &account)?;
                            account
                        }
                    };

                    let decided = SignupTxn::Established { account, claim };
                    if writes.is_empty() {
                        Ok(TxnStep::Abort(decided))
                    } else {
                        Ok(TxnStep::Commit(writes, decided))
                    }
                })
            })
            .await?;

        match outcome {
            SignupTxn::Established { account, claim } => {
                log_claim(normalized, account_id, &claim);
                if claim != ClaimResult::AlreadyOwned {
                    info!(account_id = %account.id, role = ?account.role, "Account created");
                }
                Ok((account, claim))
            }
            SignupTxn::EmailTaken { owner } => {
                log_claim(normalized, account_id, &ClaimResult::Conflict { owner });
                Err(CarelinkError::EmailAlreadyRegistered {
                    email: normalized.to_string(),
                })
            }
            SignupTxn::RoleTaken(actual) => Err(CarelinkError::RoleMismatch {
                account_id: account_id.to_string(),
                expected: role,
                actual: Some(actual),
            }),
            SignupTxn::EmailMismatch(existing) => Err(CarelinkError::IdentityMismatch {
                expected: existing,
                actual: normalized.to_string(),
            }),
        }
    }

    /// Force a credential refresh and return the session carrying the new token
    async fn refreshed(&self, ctx: &OpContext, session: &ProviderSession) -> Result<ProviderSession> {
        let token = ctx
            .guard(self.gateway.refresh_credential(session, true))
            .await??;
        Ok(ProviderSession {
            token,
            ..session.clone()
        })
    }

    async fn send_verification(&self, ctx: &OpContext, account: &AccountDoc) -> Result<()> {
        let code = ctx
            .guard(self.gateway.issue_verification_code(&account.id, &account.email))
            .await??;
        self.notifier.notify(Notification::VerifyEmail {
            account_id: account.id.clone(),
            email: account.email.clone(),
            code,
        });
        Ok(())
    }

    /// Best-effort provider sign-out
    async fn unwind(&self, session: &ProviderSession) {
        if let Err(e) = self.gateway.sign_out(session).await {
            warn!(account_id = %session.account_id, error = %e, "Provider sign-out failed");
        }
    }
}

fn normalized_or_err(email: &str) -> Result<String> {
    normalize_email(email).ok_or_else(|| CarelinkError::InvalidEmail(email.to_string()))
}

fn check_admissible(account: &AccountDoc, expected_role: Role) -> Result<()> {
    if account.role != expected_role {
        return Err(CarelinkError::RoleMismatch {
            account_id: account.id.clone(),
            expected: expected_role,
            actual: Some(account.role),
        });
    }
    if !account.is_enabled() {
        return Err(CarelinkError::AccountDisabled(account.id.clone()));
    }
    Ok(())
}
