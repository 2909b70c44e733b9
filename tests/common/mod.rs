//! Shared harness for integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};

use carelink::auth::TokenSigner;
use carelink::db::schemas::{ProfileFields, Role};
use carelink::db::MemoryStore;
use carelink::gateway::LocalCredentialGateway;
use carelink::services::{
    AuthenticatedAccount, CodeSource, Engine, EngineConfig, ManualClock, MemoryNotifier,
    Notification, OpContext, RandomCodeSource, RetryPolicy,
};

/// Hands out queued codes first, then random ones
#[derive(Default)]
pub struct ScriptedCodes {
    queue: Mutex<VecDeque<String>>,
}

impl ScriptedCodes {
    pub fn push(&self, code: &str) {
        self.queue.lock().unwrap().push_back(code.to_string());
    }
}

impl CodeSource for ScriptedCodes {
    fn next_code(&self) -> String {
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| RandomCodeSource.next_code())
    }
}

pub struct Harness {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<LocalCredentialGateway>,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<MemoryNotifier>,
    pub codes: Arc<ScriptedCodes>,
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 10,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(8),
        multiplier: 2.0,
        jitter: 0.5,
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_retry(fast_retry())
    }

    pub fn with_retry(retry: RetryPolicy) -> Self {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(LocalCredentialGateway::new(TokenSigner::new_dev()));
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        ));
        let notifier = Arc::new(MemoryNotifier::new());
        let codes = Arc::new(ScriptedCodes::default());

        let engine = Engine::with_code_source(
            store.clone(),
            gateway.clone(),
            clock.clone(),
            notifier.clone(),
            codes.clone(),
            EngineConfig {
                retry,
                ..EngineConfig::default()
            },
        );

        Self {
            engine,
            store,
            gateway,
            clock,
            notifier,
            codes,
        }
    }

    pub async fn dependent(&self, email: &str) -> AuthenticatedAccount {
        self.engine
            .accounts
            .signup_direct(
                &OpContext::new(),
                email,
                "hunter22",
                Role::Dependent,
                dependent_profile(),
            )
            .await
            .unwrap()
    }

    /// Latest verification code emailed to `account_id`
    pub fn verification_code(&self, account_id: &str) -> Option<String> {
        self.notifier
            .sent()
            .into_iter()
            .rev()
            .find_map(|n| match n {
                Notification::VerifyEmail {
                    account_id: to, code, ..
                } if to == account_id => Some(code),
                _ => None,
            })
    }

    pub async fn manager(&self, email: &str) -> AuthenticatedAccount {
        self.engine
            .accounts
            .signup_direct(
                &OpContext::new(),
                email,
                "hunter22",
                Role::Manager,
                manager_profile(),
            )
            .await
            .unwrap()
    }
}

pub fn dependent_profile() -> ProfileFields {
    ProfileFields {
        name: Some("Dana".into()),
        age: Some(34),
        ..ProfileFields::default()
    }
}

pub fn manager_profile() -> ProfileFields {
    ProfileFields {
        name: Some("Dr. Morgan".into()),
        professional_id: Some("PT-4471".into()),
        age: Some(45),
        specialty: Some("physiotherapy".into()),
        ..ProfileFields::default()
    }
}
