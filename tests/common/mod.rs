#![allow(dead_code)]

use async_trait::async_trait;
use authgate_server::auth::RateLimiter;
use authgate_server::clock::{Clock, ManualClock};
use authgate_server::db::{IdentityView, MemoryStore};
use authgate_server::error::NotifyError;
use authgate_server::notify::Notifier;
use authgate_server::{AuthCore, Settings};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

pub const PASSWORD: &str = "Str0ng#Pass";

/// Raw tokens and lockout notices handed to the notifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Verification { email: String, token: String },
    PasswordReset { email: String, token: String },
    Lockout { username: String },
}

pub struct RecordingNotifier {
    tx: mpsc::UnboundedSender<Sent>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_lockout_notice(&self, identity: &IdentityView) -> Result<(), NotifyError> {
        let _ = self.tx.send(Sent::Lockout {
            username: identity.username.clone(),
        });
        Ok(())
    }

    async fn send_verification(&self, email: &str, token: &str) -> Result<(), NotifyError> {
        let _ = self.tx.send(Sent::Verification {
            email: email.to_string(),
            token: token.to_string(),
        });
        Ok(())
    }

    async fn send_password_reset(&self, email: &str, token: &str) -> Result<(), NotifyError> {
        let _ = self.tx.send(Sent::PasswordReset {
            email: email.to_string(),
            token: token.to_string(),
        });
        Ok(())
    }
}

pub struct TestCore {
    pub core: Arc<AuthCore>,
    pub store: MemoryStore,
    pub clock: ManualClock,
    outbox: Mutex<mpsc::UnboundedReceiver<Sent>>,
}

impl TestCore {
    pub fn new() -> Self {
        Self::with_settings(Settings::new_for_test().expect("test settings"))
    }

    pub fn with_settings(settings: Settings) -> Self {
        let store = MemoryStore::new();
        let clock = ManualClock::default();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let (tx, rx) = mpsc::unbounded_channel();

        let core = AuthCore::new(
            &settings,
            Arc::new(store.clone()),
            Arc::new(RateLimiter::local(shared_clock.clone())),
            Arc::new(RecordingNotifier { tx }),
            shared_clock,
        )
        .expect("auth core");

        Self {
            core: Arc::new(core),
            store,
            clock,
            outbox: Mutex::new(rx),
        }
    }

    pub async fn register(&self, username: &str) -> IdentityView {
        self.core
            .register(username, &format!("{}@example.com", username), PASSWORD, "192.0.2.1")
            .await
            .expect("registration")
    }

    /// Waits for the next notification matching `pick`, skipping others.
    pub async fn next_sent<T>(&self, pick: impl Fn(Sent) -> Option<T>) -> T {
        let mut outbox = self.outbox.lock().await;
        loop {
            let sent = tokio::time::timeout(Duration::from_secs(5), outbox.recv())
                .await
                .expect("no notification sent")
                .expect("notifier dropped");
            if let Some(value) = pick(sent) {
                return value;
            }
        }
    }

    pub async fn next_reset_token(&self) -> String {
        self.next_sent(|sent| match sent {
            Sent::PasswordReset { token, .. } => Some(token),
            _ => None,
        })
        .await
    }

    pub async fn next_verification_token(&self) -> String {
        self.next_sent(|sent| match sent {
            Sent::Verification { token, .. } => Some(token),
            _ => None,
        })
        .await
    }
}
