//! In-process identity provider
//!
//! Password identities live in a `DashMap` keyed by normalized email, with
//! Argon2id hashes. Tokens are HS256 JWTs from [`TokenSigner`]; each account
//! carries a token generation that `sign_out` bumps to revoke every token
//! issued before it.
//!
//! Verification and reset codes are action codes from the same signer. A reset
//! code carries a digest of the password hash it was issued against, so it
//! stops working once the password changes.
//!
//! Federated identities are produced by whatever fronts the provider (an
//! OAuth callback in production, the test harness in tests) through
//! [`LocalCredentialGateway::stage_federated`] and friends.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{CredentialGateway, GatewayError, ProviderSession, VerifiedIdentity};
use crate::auth::{hash_password, verify_password, ActionPurpose, Claims, TokenSigner};
use crate::db::schemas::{normalize_email, SignInMethod};

const VERIFICATION_CODE_TTL_SECS: u64 = 24 * 60 * 60;
const RESET_CODE_TTL_SECS: u64 = 60 * 60;

/// A federated identity waiting to be picked up by a sign-in flow
#[derive(Debug, Clone)]
pub struct StagedIdentity {
    pub account_id: String,
    pub email: String,
    pub display_name: Option<String>,
}

impl StagedIdentity {
    /// Stage a federated identity with a freshly minted provider id
    pub fn new(email: impl Into<String>, display_name: Option<String>) -> Self {
        Self {
            account_id: uuid::Uuid::new_v4().simple().to_string(),
            email: email.into(),
            display_name,
        }
    }
}

#[derive(Debug, Clone)]
struct PasswordRecord {
    account_id: String,
    email: String,
    password_hash: String,
}

/// Self-contained credential provider
pub struct LocalCredentialGateway {
    signer: TokenSigner,
    /// Password identities by normalized email
    passwords: DashMap<String, PasswordRecord>,
    /// Token generation per account id
    generations: DashMap<String, u32>,
    popup: Mutex<VecDeque<Result<StagedIdentity, GatewayError>>>,
    redirects: Mutex<VecDeque<StagedIdentity>>,
    forced_refreshes: AtomicU64,
}

impl LocalCredentialGateway {
    pub fn new(signer: TokenSigner) -> Self {
        Self {
            signer,
            passwords: DashMap::new(),
            generations: DashMap::new(),
            popup: Mutex::new(VecDeque::new()),
            redirects: Mutex::new(VecDeque::new()),
            forced_refreshes: AtomicU64::new(0),
        }
    }

    /// Queue a federated identity for the next popup sign-in
    pub fn stage_federated(&self, identity: StagedIdentity) -> Result<(), GatewayError> {
        lock(&self.popup)?.push_back(Ok(identity));
        Ok(())
    }

    /// Make the next popup sign-in fail
    pub fn stage_popup_failure(&self, err: GatewayError) -> Result<(), GatewayError> {
        lock(&self.popup)?.push_back(Err(err));
        Ok(())
    }

    /// Queue a federated identity delivered through the redirect flow
    pub fn stage_redirect(&self, identity: StagedIdentity) -> Result<(), GatewayError> {
        lock(&self.redirects)?.push_back(identity);
        Ok(())
    }

    /// Number of forced refreshes served so far
    pub fn forced_refreshes(&self) -> u64 {
        self.forced_refreshes.load(Ordering::Relaxed)
    }

    fn generation(&self, account_id: &str) -> u32 {
        *self.generations.entry(account_id.to_string()).or_insert(1)
    }

    fn session_for(
        &self,
        account_id: &str,
        email: &str,
        display_name: Option<String>,
        method: SignInMethod,
    ) -> Result<ProviderSession, GatewayError> {
        let gen = self.generation(account_id);
        let token = self.signer.issue(account_id, email, gen)?;
        Ok(ProviderSession {
            account_id: account_id.to_string(),
            email: email.to_string(),
            display_name,
            method,
            token,
        })
    }

    fn federated_session(&self, identity: StagedIdentity) -> Result<ProviderSession, GatewayError> {
        info!(account_id = %identity.account_id, "Federated identity authenticated");
        self.session_for(
            &identity.account_id,
            &identity.email,
            identity.display_name,
            SignInMethod::Federated,
        )
    }

    fn check_generation(&self, claims: &Claims) -> Result<(), GatewayError> {
        if claims.gen != self.generation(&claims.sub) {
            return Err(GatewayError::SessionRevoked);
        }
        Ok(())
    }

    fn revoke_sessions(&self, account_id: &str) {
        let mut gen = self.generations.entry(account_id.to_string()).or_insert(1);
        *gen += 1;
    }
}

fn password_stamp(password_hash: &str) -> String {
    hex::encode(&Sha256::digest(password_hash.as_bytes())[..12])
}

#[async_trait]
impl CredentialGateway for LocalCredentialGateway {
    async fn create_account_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<ProviderSession, GatewayError> {
        let normalized = normalize_email(email).ok_or(GatewayError::InvalidEmail)?;
        if self.passwords.contains_key(&normalized) {
            return Err(GatewayError::EmailInUse);
        }

        let password = password.to_string();
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| GatewayError::Internal(format!("Hashing task failed: {}", e)))??;

        let record = match self.passwords.entry(normalized) {
            Entry::Occupied(_) => return Err(GatewayError::EmailInUse),
            Entry::Vacant(slot) => {
                let record = PasswordRecord {
                    account_id: uuid::Uuid::new_v4().simple().to_string(),
                    email: email.trim().to_string(),
                    password_hash,
                };
                slot.insert(record.clone());
                record
            }
        };

        info!(account_id = %record.account_id, "Created password identity");
        self.session_for(&record.account_id, &record.email, None, SignInMethod::Password)
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<ProviderSession, GatewayError> {
        let normalized = normalize_email(email).ok_or(GatewayError::InvalidEmail)?;
        let record = self
            .passwords
            .get(&normalized)
            .map(|r| r.value().clone())
            .ok_or(GatewayError::UserNotFound)?;

        let password = password.to_string();
        let hash = record.password_hash.clone();
        let matches = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .map_err(|e| GatewayError::Internal(format!("Verification task failed: {}", e)))??;

        if !matches {
            return Err(GatewayError::WrongPassword);
        }

        self.session_for(&record.account_id, &record.email, None, SignInMethod::Password)
    }

    async fn begin_federated_sign_in(&self) -> Result<ProviderSession, GatewayError> {
        let staged = lock(&self.popup)?.pop_front();
        match staged {
            Some(Ok(identity)) => self.federated_session(identity),
            Some(Err(err)) => Err(err),
            None => Err(GatewayError::PopupClosed),
        }
    }

    async fn federated_redirect_result(&self) -> Result<Option<ProviderSession>, GatewayError> {
        let staged = lock(&self.redirects)?.pop_front();
        staged.map(|identity| self.federated_session(identity)).transpose()
    }

    async fn refresh_credential(
        &self,
        session: &ProviderSession,
        force: bool,
    ) -> Result<String, GatewayError> {
        if !force {
            if let Ok(claims) = self.signer.verify(&session.token) {
                if claims.sub == session.account_id && self.check_generation(&claims).is_ok() {
                    return Ok(session.token.clone());
                }
            }
        }

        let gen = self.generation(&session.account_id);
        let presented = self.signer.verify_ignoring_expiry(&session.token)?;
        if presented.sub != session.account_id {
            return Err(GatewayError::InvalidToken("Token subject mismatch".into()));
        }
        if presented.gen != gen {
            return Err(GatewayError::SessionRevoked);
        }

        if force {
            self.forced_refreshes.fetch_add(1, Ordering::Relaxed);
            debug!(account_id = %session.account_id, "Forced credential refresh");
        }
        self.signer.issue(&session.account_id, &presented.email, gen)
    }

    async fn verify_credential(&self, token: &str) -> Result<VerifiedIdentity, GatewayError> {
        let claims = self.signer.verify(token)?;
        self.check_generation(&claims)?;
        Ok(VerifiedIdentity {
            account_id: claims.sub,
            email: claims.email,
        })
    }

    async fn sign_out(&self, session: &ProviderSession) -> Result<(), GatewayError> {
        self.revoke_sessions(&session.account_id);
        info!(account_id = %session.account_id, "Provider session signed out");
        Ok(())
    }

    async fn issue_verification_code(
        &self,
        account_id: &str,
        email: &str,
    ) -> Result<String, GatewayError> {
        self.signer.issue_action(
            account_id,
            email,
            ActionPurpose::VerifyEmail,
            "",
            VERIFICATION_CODE_TTL_SECS,
        )
    }

    async fn apply_verification_code(&self, code: &str) -> Result<VerifiedIdentity, GatewayError> {
        let claims = self.signer.verify_action(code, ActionPurpose::VerifyEmail)?;
        Ok(VerifiedIdentity {
            account_id: claims.sub,
            email: claims.email,
        })
    }

    async fn issue_password_reset_code(
        &self,
        email: &str,
    ) -> Result<(VerifiedIdentity, String), GatewayError> {
        let normalized = normalize_email(email).ok_or(GatewayError::InvalidEmail)?;
        let record = self
            .passwords
            .get(&normalized)
            .map(|r| r.value().clone())
            .ok_or(GatewayError::UserNotFound)?;

        let code = self.signer.issue_action(
            &record.account_id,
            &record.email,
            ActionPurpose::ResetPassword,
            &password_stamp(&record.password_hash),
            RESET_CODE_TTL_SECS,
        )?;
        Ok((
            VerifiedIdentity {
                account_id: record.account_id,
                email: record.email,
            },
            code,
        ))
    }

    async fn confirm_password_reset(
        &self,
        code: &str,
        new_password: &str,
    ) -> Result<VerifiedIdentity, GatewayError> {
        let claims = self.signer.verify_action(code, ActionPurpose::ResetPassword)?;
        let normalized = normalize_email(&claims.email).ok_or(GatewayError::InvalidEmail)?;

        let password = new_password.to_string();
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| GatewayError::Internal(format!("Hashing task failed: {}", e)))??;

        {
            let mut record = self
                .passwords
                .get_mut(&normalized)
                .ok_or(GatewayError::UserNotFound)?;
            if record.account_id != claims.sub
                || password_stamp(&record.password_hash) != claims.stamp
            {
                return Err(GatewayError::InvalidToken("Reset code already used".into()));
            }
            record.password_hash = password_hash;
        }

        self.revoke_sessions(&claims.sub);
        info!(account_id = %claims.sub, "Password reset");
        Ok(VerifiedIdentity {
            account_id: claims.sub,
            email: claims.email,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>, GatewayError> {
    mutex
        .lock()
        .map_err(|_| GatewayError::Internal("Provider state lock poisoned".into()))
}
