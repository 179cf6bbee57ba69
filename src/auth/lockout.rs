//! Failed-login accounting and temporary account lockout.
//!
//! Failures are appended to a log and counted inside a sliding window. Once
//! the count reaches the configured maximum the identity is locked until a
//! deadline; the lock is lifted lazily by the first check that observes the
//! deadline in the past.

use chrono::Duration;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::LockoutConfig;
use crate::db::{AuthStore, FailedAttemptRecord, Identity, LockState};
use crate::error::{AppError, AuthError};
use crate::notify::Notifications;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The failure was counted; `failures` is the count inside the window.
    Recorded { failures: u32 },
    /// This failure reached the threshold and locked the identity.
    Locked { until: chrono::DateTime<chrono::Utc> },
}

pub struct LoginAttemptTracker {
    store: Arc<dyn AuthStore>,
    clock: Arc<dyn Clock>,
    notifications: Notifications,
    max_attempts: u32,
    lockout_duration: Duration,
    window: Duration,
}

impl LoginAttemptTracker {
    pub fn new(
        config: &LockoutConfig,
        store: Arc<dyn AuthStore>,
        clock: Arc<dyn Clock>,
        notifications: Notifications,
    ) -> Self {
        Self {
            store,
            clock,
            notifications,
            max_attempts: config.max_login_attempts.max(1),
            lockout_duration: Duration::minutes(config.lockout_duration_minutes),
            window: Duration::minutes(config.attempt_window_minutes),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Rejects a locked identity without counting an attempt. An expired
    /// lock is cleared here.
    pub async fn ensure_unlocked(&self, identity: &Identity) -> Result<(), AppError> {
        match identity.lock_state() {
            LockState::Unlocked => Ok(()),
            LockState::Locked { until: Some(until) } => {
                let now = self.clock.now();
                if now <= until {
                    return Err(AuthError::AccountLocked {
                        locked_until: Some(until),
                    }
                    .into());
                }
                if self.store.clear_expired_lock(identity.id, now).await? {
                    info!(
                        target: "auth.lockout",
                        identity_id = %identity.id,
                        "Lock expired, identity unlocked"
                    );
                }
                Ok(())
            }
            LockState::Locked { until: None } => {
                Err(AuthError::AccountLocked { locked_until: None }.into())
            }
        }
    }

    /// Counts a failed login for `username`. Unknown usernames are counted
    /// too but never lock anything.
    pub async fn record_failure(
        &self,
        username: &str,
        identity: Option<&Identity>,
        source: &str,
    ) -> Result<AttemptOutcome, AppError> {
        let now = self.clock.now();
        let record = FailedAttemptRecord::new(username, source, now);
        let failures = self
            .store
            .record_failed_attempt(&record, now - self.window)
            .await?;

        warn!(
            target: "auth.login.failed",
            username = %record.username,
            source = %record.source_address,
            failures,
            known = identity.is_some(),
            "Failed login attempt"
        );

        let Some(identity) = identity else {
            return Ok(AttemptOutcome::Recorded { failures });
        };
        if failures < self.max_attempts {
            return Ok(AttemptOutcome::Recorded { failures });
        }

        let until = now + self.lockout_duration;
        self.store.lock_identity(identity.id, until).await?;
        warn!(
            target: "auth.lockout",
            identity_id = %identity.id,
            failures,
            locked_until = %until,
            "Identity locked after repeated failures"
        );

        let mut view = identity.view();
        view.is_locked = true;
        self.notifications.lockout(view);

        Ok(AttemptOutcome::Locked { until })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Settings;
    use crate::db::MemoryStore;
    use crate::notify::LogNotifier;
    use chrono::Utc;

    struct Fixture {
        tracker: LoginAttemptTracker,
        store: MemoryStore,
        clock: ManualClock,
        identity: Identity,
    }

    async fn fixture() -> Fixture {
        let settings = Settings::new_for_test().unwrap();
        let store = MemoryStore::new();
        let clock = ManualClock::default();
        let identity = Identity::new("carol".into(), "carol@example.com".into(), "h".into(), clock.now());
        store.insert_identity(&identity).await.unwrap();

        let tracker = LoginAttemptTracker::new(
            &settings.lockout,
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            Notifications::new(Arc::new(LogNotifier)),
        );
        Fixture { tracker, store, clock, identity }
    }

    #[tokio::test]
    async fn test_locks_on_fifth_failure() {
        let f = fixture().await;

        for expected in 1..5 {
            let outcome = f
                .tracker
                .record_failure("carol", Some(&f.identity), "10.0.0.1")
                .await
                .unwrap();
            assert_eq!(outcome, AttemptOutcome::Recorded { failures: expected });
        }

        let outcome = f
            .tracker
            .record_failure("carol", Some(&f.identity), "10.0.0.1")
            .await
            .unwrap();
        let until = f.clock.now() + Duration::minutes(30);
        assert_eq!(outcome, AttemptOutcome::Locked { until });

        let stored = f.store.find_identity_by_id(f.identity.id).await.unwrap().unwrap();
        assert_eq!(stored.lock_state(), LockState::Locked { until: Some(until) });
    }

    #[tokio::test]
    async fn test_unknown_username_never_locks() {
        let f = fixture().await;
        for _ in 0..10 {
            let outcome = f.tracker.record_failure("nobody", None, "10.0.0.1").await.unwrap();
            assert!(matches!(outcome, AttemptOutcome::Recorded { .. }));
        }
        assert_eq!(f.store.failed_attempt_count().await, 10);
    }

    #[tokio::test]
    async fn test_failures_outside_window_are_not_counted() {
        let f = fixture().await;
        for _ in 0..4 {
            f.tracker
                .record_failure("carol", Some(&f.identity), "10.0.0.1")
                .await
                .unwrap();
        }

        f.clock.advance(Duration::minutes(31));
        let outcome = f
            .tracker
            .record_failure("carol", Some(&f.identity), "10.0.0.1")
            .await
            .unwrap();
        assert_eq!(outcome, AttemptOutcome::Recorded { failures: 1 });
    }

    #[tokio::test]
    async fn test_lock_expires_lazily() {
        let f = fixture().await;
        let until = f.clock.now() + Duration::minutes(30);
        f.store.lock_identity(f.identity.id, until).await.unwrap();

        let locked = f.store.find_identity_by_id(f.identity.id).await.unwrap().unwrap();
        let err = f.tracker.ensure_unlocked(&locked).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::AuthError(AuthError::AccountLocked { locked_until: Some(t) }) if t == until
        ));

        f.clock.advance(Duration::minutes(31));
        f.tracker.ensure_unlocked(&locked).await.unwrap();

        let stored = f.store.find_identity_by_id(f.identity.id).await.unwrap().unwrap();
        assert_eq!(stored.lock_state(), LockState::Unlocked);
    }

    #[tokio::test]
    async fn test_indefinite_lock_never_expires() {
        let f = fixture().await;
        let mut identity = f.identity.clone();
        identity.is_locked = true;
        identity.locked_until = None;

        f.clock.set(Utc::now() + Duration::days(365));
        let err = f.tracker.ensure_unlocked(&identity).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::AuthError(AuthError::AccountLocked { locked_until: None })
        ));
    }
}
