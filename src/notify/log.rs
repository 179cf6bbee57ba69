use async_trait::async_trait;
use tracing::info;

use super::Notifier;
use crate::db::IdentityView;
use crate::error::NotifyError;

/// Records notifications as tracing events. Token values are never logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_lockout_notice(&self, identity: &IdentityView) -> Result<(), NotifyError> {
        info!(target: "auth.notify", identity_id = %identity.id, "Lockout notice queued");
        Ok(())
    }

    async fn send_verification(&self, email: &str, _token: &str) -> Result<(), NotifyError> {
        info!(target: "auth.notify", email, "Verification email queued");
        Ok(())
    }

    async fn send_password_reset(&self, email: &str, _token: &str) -> Result<(), NotifyError> {
        info!(target: "auth.notify", email, "Password reset email queued");
        Ok(())
    }
}
