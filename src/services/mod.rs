//! Services layer for CareLink
//!
//! Business logic that coordinates the credential gateway and the document
//! store.
//!
//! ## Services
//!
//! - **EmailClaimLedger**: one owner per normalized email, orphan reclaim
//! - **AccountReconciler**: signup, sign-in and federated completion
//! - **LinkingCodeService**: single-use dependent → manager linking codes
//! - **AssignmentProgressTracker**: session history and derived progress
//!
//! [`Engine`] wires all four onto one store, gateway and clock.

pub mod clock;
pub mod context;
pub mod ledger;
pub mod linking;
pub mod notify;
pub mod progress;
pub mod reconciler;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::OpContext;
pub use ledger::{ClaimPlan, ClaimResult, EmailClaimLedger};
pub use linking::{CodeSource, GeneratedCode, LinkResult, LinkingCodeService, RandomCodeSource};
pub use notify::{ChannelNotifier, LogNotifier, MemoryNotifier, Notification, Notifier};
pub use progress::{AssignmentProgressTracker, Completion};
pub use reconciler::{
    AccountReconciler, AuthenticatedAccount, FederatedSignIn, PendingFederatedSignup,
};
pub use retry::{CallerCredentials, RetryPolicy};

use std::sync::Arc;

use crate::db::DocumentStore;
use crate::gateway::CredentialGateway;

/// Tunables shared by the engine's services
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub link_code_ttl: chrono::Duration,
    /// Percentage points added per completed session
    pub progress_increment: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            link_code_ttl: chrono::Duration::hours(24),
            progress_increment: 20,
        }
    }
}

/// All engine services over one store and one credential gateway
#[derive(Clone)]
pub struct Engine {
    pub store: Arc<dyn DocumentStore>,
    pub gateway: Arc<dyn CredentialGateway>,
    pub ledger: EmailClaimLedger,
    pub accounts: AccountReconciler,
    pub links: LinkingCodeService,
    pub progress: AssignmentProgressTracker,
}

impl Engine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        gateway: Arc<dyn CredentialGateway>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        Self::with_code_source(
            store,
            gateway,
            clock,
            notifier,
            Arc::new(RandomCodeSource),
            config,
        )
    }

    /// Like [`Engine::new`] with a caller-chosen linking code source
    pub fn with_code_source(
        store: Arc<dyn DocumentStore>,
        gateway: Arc<dyn CredentialGateway>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        codes: Arc<dyn CodeSource>,
        config: EngineConfig,
    ) -> Self {
        let EngineConfig {
            retry,
            link_code_ttl,
            progress_increment,
        } = config;

        Self {
            ledger: EmailClaimLedger::new(store.clone(), clock.clone(), retry.clone()),
            accounts: AccountReconciler::new(
                store.clone(),
                gateway.clone(),
                clock.clone(),
                notifier.clone(),
                retry.clone(),
            ),
            links: LinkingCodeService::new(
                store.clone(),
                clock.clone(),
                notifier,
                codes,
                retry.clone(),
                link_code_ttl,
            ),
            progress: AssignmentProgressTracker::new(
                store.clone(),
                clock,
                retry,
                progress_increment,
            ),
            store,
            gateway,
        }
    }
}
