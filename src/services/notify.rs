//! Out-of-band notifications (verification and reset emails, link confirmations)
//!
//! `notify` never blocks and never fails the operation that triggered it.
//! Codes travel only inside the notification; sinks that log must not print them.

use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Ask a direct signup to confirm their address
    VerifyEmail {
        account_id: String,
        email: String,
        code: String,
    },
    /// Deliver a password-reset code
    PasswordReset {
        account_id: String,
        email: String,
        code: String,
    },
    /// Tell a dependent a manager redeemed their code
    ManagerLinked {
        dependent_account_id: String,
        manager_account_id: String,
    },
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        match &notification {
            Notification::VerifyEmail { account_id, .. } => {
                info!(account_id = %account_id, "Verification email queued");
            }
            Notification::PasswordReset { account_id, .. } => {
                info!(account_id = %account_id, "Password reset email queued");
            }
            Notification::ManagerLinked {
                dependent_account_id,
                manager_account_id,
            } => {
                info!(
                    dependent = %dependent_account_id,
                    manager = %manager_account_id,
                    "Link notification queued"
                );
            }
        }
    }
}

/// Queues notifications for a background delivery task
pub struct ChannelNotifier {
    tx: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    /// Start a delivery task that hands each notification to `sink`
    pub fn spawn<S>(capacity: usize, sink: S) -> (Self, JoinHandle<()>)
    where
        S: Notifier + 'static,
    {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                sink.notify(notification);
            }
            debug!("Notification channel closed");
        });
        (Self { tx }, handle)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        if let Err(e) = self.tx.try_send(notification) {
            warn!(error = %e, "Dropping notification");
        }
    }
}

/// Records notifications for inspection
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, notification: Notification) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification);
        }
    }
}

impl<N: Notifier + ?Sized> Notifier for std::sync::Arc<N> {
    fn notify(&self, notification: Notification) {
        (**self).notify(notification);
    }
}
