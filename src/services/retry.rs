//! Bounded retry with exponential backoff
//!
//! One policy for every store interaction. Conflicts and transient network
//! failures are retried after a backoff. Stale or rejected credentials are
//! retried too, after forcing a credential refresh. Running out of attempts
//! yields a typed error naming what kept failing; it never turns into a
//! success.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use super::context::OpContext;
use crate::db::StoreError;
use crate::gateway::{CredentialGateway, ProviderSession};
use crate::types::{CarelinkError, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Fraction of the backoff added or removed at random (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

/// The caller's provider session, refreshed when the store rejects it
#[derive(Clone, Copy)]
pub struct CallerCredentials<'a> {
    pub gateway: &'a dyn CredentialGateway,
    pub session: &'a ProviderSession,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based), without jitter
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31) as i32;
        let nanos = self.initial_backoff.as_nanos() as f64 * self.multiplier.powi(exp);
        let capped = nanos.min(self.max_backoff.as_nanos() as f64);
        Duration::from_nanos(capped as u64)
    }

    /// Run `op` until it succeeds, fails for good, or attempts run out
    pub async fn run<T, F, Fut>(
        &self,
        ctx: &OpContext,
        label: &str,
        credentials: Option<CallerCredentials<'_>>,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, StoreError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let err = match ctx.guard(op()).await? {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(CarelinkError::Store(err));
            }
            if attempt >= max_attempts {
                return Err(exhausted(err, attempt));
            }

            if err.needs_credential_refresh() {
                if let Some(creds) = credentials {
                    debug!(
                        op = label,
                        account_id = %creds.session.account_id,
                        "Forcing credential refresh before retry"
                    );
                    ctx.guard(creds.gateway.refresh_credential(creds.session, true))
                        .await??;
                }
            }

            let backoff = apply_jitter(self.backoff_for(attempt), self.jitter);
            debug!(
                op = label,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Retrying after backoff"
            );
            ctx.sleep(backoff).await?;
        }
    }
}

fn exhausted(err: StoreError, attempts: u32) -> CarelinkError {
    match err {
        StoreError::Conflict { key } => CarelinkError::ContentionExhausted { key, attempts },
        StoreError::Unauthenticated => CarelinkError::StaleCredential { attempts },
        StoreError::PermissionDenied { key } => CarelinkError::PermissionDenied { key, attempts },
        StoreError::Unavailable(msg) => CarelinkError::StoreUnavailable(msg),
        other => CarelinkError::Store(other),
    }
}

/// Spread `dur` uniformly over `[dur * (1 - factor), dur * (1 + factor)]`
fn apply_jitter(dur: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || dur.is_zero() {
        return dur;
    }

    let factor = factor.clamp(0.0, 1.0);
    let base = dur.as_nanos() as f64;
    let jittered = rand::thread_rng().gen_range(base * (1.0 - factor)..=base * (1.0 + factor));
    Duration::from_nanos(jittered as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenSigner;
    use crate::gateway::LocalCredentialGateway;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(50));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(20), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let base = Duration::from_millis(100);
        for _ in 0..50 {
            let d = apply_jitter(base, 0.2);
            assert!(d >= Duration::from_millis(80) && d <= Duration::from_millis(120));
        }
        assert_eq!(apply_jitter(base, 0.0), base);
    }

    #[tokio::test]
    async fn test_conflicts_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result = fast_policy(5)
            .run(&OpContext::new(), "test", None, || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Conflict { key: "k".into() })
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_conflict_is_typed() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let err = fast_policy(3)
            .run(&OpContext::new(), "test", None, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StoreError::Conflict {
                    key: "assignments/a1".into(),
                })
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(
            err,
            CarelinkError::ContentionExhausted { ref key, attempts: 3 } if key == "assignments/a1"
        ));
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let err = fast_policy(5)
            .run(&OpContext::new(), "test", None, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StoreError::Backend("bad".into()))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, CarelinkError::Store(StoreError::Backend(_))));
    }

    #[tokio::test]
    async fn test_stale_credential_forces_refresh() {
        let gateway = LocalCredentialGateway::new(TokenSigner::new_dev());
        let session = gateway
            .create_account_with_password("r@example.com", "secret-1")
            .await
            .unwrap();
        let creds = CallerCredentials {
            gateway: &gateway,
            session: &session,
        };

        let calls = AtomicU32::new(0);
        let calls = &calls;
        fast_policy(5)
            .run(&OpContext::new(), "test", Some(creds), || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(StoreError::Unauthenticated)
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(gateway.forced_refreshes(), 1);

        let err = fast_policy(2)
            .run(&OpContext::new(), "test", Some(creds), || async move {
                Err::<(), _>(StoreError::PermissionDenied {
                    key: "accounts/x".into(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CarelinkError::PermissionDenied { attempts: 2, .. }
        ));
        assert_eq!(gateway.forced_refreshes(), 2);
    }

    #[tokio::test]
    async fn test_cancellation_stops_retries() {
        let ctx = OpContext::new();
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let policy = RetryPolicy {
            initial_backoff: Duration::from_secs(30),
            ..fast_policy(5)
        };

        let token = ctx.token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let err = policy
            .run(&ctx, "test", None, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StoreError::Conflict { key: "k".into() })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CarelinkError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
