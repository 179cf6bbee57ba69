//! Outbound notifications (lockout notices, verification and reset links).
//!
//! Delivery is fire-and-forget: [`Notifications`] hands each message to a
//! spawned task and only logs failures, so a broken relay can never fail or
//! slow down the auth operation that triggered it.

mod http;
mod log;

pub use http::HttpNotifier;
pub use log::LogNotifier;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::db::IdentityView;
use crate::error::NotifyError;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_lockout_notice(&self, identity: &IdentityView) -> Result<(), NotifyError>;
    async fn send_verification(&self, email: &str, token: &str) -> Result<(), NotifyError>;
    async fn send_password_reset(&self, email: &str, token: &str) -> Result<(), NotifyError>;
}

/// Spawning wrapper around a [`Notifier`].
#[derive(Clone)]
pub struct Notifications {
    notifier: Arc<dyn Notifier>,
}

impl Notifications {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    pub fn lockout(&self, identity: IdentityView) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.send_lockout_notice(&identity).await {
                warn!(identity_id = %identity.id, error = %e, "Failed to send lockout notice");
            }
        });
    }

    pub fn verification(&self, email: String, token: String) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.send_verification(&email, &token).await {
                warn!(error = %e, "Failed to send verification email");
            }
        });
    }

    pub fn password_reset(&self, email: String, token: String) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.send_password_reset(&email, &token).await {
                warn!(error = %e, "Failed to send password reset email");
            }
        });
    }
}
