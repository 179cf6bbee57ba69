mod common;

use authgate_server::auth::{PasswordHasher, TokenType};
use authgate_server::clock::Clock;
use authgate_server::db::{AuthStore, LockState};
use authgate_server::error::{AppError, AuthError};
use authgate_server::Settings;
use chrono::Duration;
use common::{Sent, TestCore, PASSWORD};
use uuid::Uuid;

const WRONG: &str = "Wr0ng#Pass";

fn auth_error(result: Result<impl std::fmt::Debug, AppError>) -> AuthError {
    match result {
        Err(AppError::AuthError(e)) => e,
        other => panic!("expected an auth error, got {:?}", other),
    }
}

#[test]
fn test_hash_roundtrip_for_varied_passwords() {
    let settings = Settings::new_for_test().unwrap();
    let hasher = PasswordHasher::new(&settings.password);
    let long = "L0ng#".repeat(25);
    for password in ["Short#1a", "ünïcødé#Pass1", long.as_str()] {
        let hash = hasher.hash(password).unwrap();
        assert!(hasher.verify(password, &hash));
        assert!(!hasher.verify(&format!("{}x", password), &hash));
    }
}

#[test_log::test(tokio::test)]
async fn test_lockout_after_five_failures() {
    let t = TestCore::new();
    let identity = t.register("alice").await;

    for i in 1..=4 {
        let source = format!("10.0.0.{}", i);
        let err = auth_error(t.core.login("alice", WRONG, &source).await);
        assert_eq!(err, AuthError::InvalidCredentials);
    }

    // The attempt that reaches the threshold already reports the lock.
    let err = auth_error(t.core.login("alice", WRONG, "10.0.0.5").await);
    let until = t.clock.now() + Duration::minutes(30);
    assert_eq!(err, AuthError::AccountLocked { locked_until: Some(until) });

    let lockout = t
        .next_sent(|sent| match sent {
            Sent::Lockout { username } => Some(username),
            _ => None,
        })
        .await;
    assert_eq!(lockout, "alice");

    // Correct password is still refused and does not consume attempts.
    let err = auth_error(t.core.login("alice", PASSWORD, "10.0.0.6").await);
    assert!(matches!(err, AuthError::AccountLocked { .. }));
    let err = auth_error(t.core.login("alice", WRONG, "10.0.0.7").await);
    assert!(matches!(err, AuthError::AccountLocked { .. }));
    assert_eq!(t.store.failed_attempt_count().await, 5);

    // Exactly at the deadline the lock still holds.
    t.clock.advance(Duration::minutes(30));
    let err = auth_error(t.core.login("alice", PASSWORD, "10.0.0.8").await);
    assert!(matches!(err, AuthError::AccountLocked { .. }));

    t.clock.advance(Duration::seconds(1));
    t.core.login("alice", PASSWORD, "10.0.0.9").await.unwrap();

    let stored = t.store.find_identity_by_id(identity.id).await.unwrap().unwrap();
    assert_eq!(stored.lock_state(), LockState::Unlocked);
}

#[tokio::test]
async fn test_evaluated_normally_after_lock_expires() {
    let t = TestCore::new();
    t.register("alice").await;

    for i in 1..=5 {
        let _ = t.core.login("alice", WRONG, &format!("10.0.1.{}", i)).await;
    }
    t.clock.advance(Duration::minutes(31));

    // The old failures fell out of the window, so one more does not relock.
    let err = auth_error(t.core.login("alice", WRONG, "10.0.1.6").await);
    assert_eq!(err, AuthError::InvalidCredentials);
    assert!(t.core.login("alice", PASSWORD, "10.0.1.7").await.is_ok());
}

#[tokio::test]
async fn test_success_does_not_clear_failures_in_window() {
    let t = TestCore::new();
    t.register("alice").await;

    for i in 1..=4 {
        let _ = t.core.login("alice", WRONG, &format!("10.0.2.{}", i)).await;
    }
    t.core.login("alice", PASSWORD, "10.0.2.5").await.unwrap();

    let err = auth_error(t.core.login("alice", WRONG, "10.0.2.6").await);
    assert!(matches!(err, AuthError::AccountLocked { .. }));
}

#[tokio::test]
async fn test_login_rate_limit_by_source() {
    let t = TestCore::new();

    for _ in 1..=5 {
        let err = auth_error(t.core.login("ghost", WRONG, "203.0.113.9").await);
        assert_eq!(err, AuthError::InvalidCredentials);
    }
    let err = auth_error(t.core.login("ghost", WRONG, "203.0.113.9").await);
    assert_eq!(err, AuthError::RateLimited);

    // Other sources are unaffected.
    let err = auth_error(t.core.login("ghost", WRONG, "203.0.113.10").await);
    assert_eq!(err, AuthError::InvalidCredentials);

    t.clock.advance(Duration::seconds(60));
    let err = auth_error(t.core.login("ghost", WRONG, "203.0.113.9").await);
    assert_eq!(err, AuthError::InvalidCredentials);
}

#[tokio::test]
async fn test_unknown_username_is_never_locked_out() {
    let t = TestCore::new();
    for i in 1..=8 {
        let err = auth_error(t.core.login("ghost", WRONG, &format!("10.0.3.{}", i)).await);
        assert_eq!(err, AuthError::InvalidCredentials);
    }
}

#[tokio::test]
async fn test_overlong_login_input_is_invalid_credentials() {
    let t = TestCore::new();
    let username = "g".repeat(60);
    let source = format!("2001:db8::{}", ":ffff".repeat(12));

    for _ in 0..2 {
        let err = auth_error(t.core.login(&username, WRONG, &source).await);
        assert_eq!(err, AuthError::InvalidCredentials);
    }
    assert_eq!(t.store.failed_attempt_count().await, 2);
}

#[test_log::test(tokio::test)]
async fn test_refresh_rotation_rejects_reuse() {
    let t = TestCore::new();
    t.register("alice").await;
    let first = t.core.login("alice", PASSWORD, "10.0.4.1").await.unwrap();

    let second = t.core.refresh(&first.refresh_token).await.unwrap();
    assert_ne!(second.refresh_token, first.refresh_token);
    assert_ne!(second.access_token, first.access_token);

    let err = auth_error(t.core.refresh(&first.refresh_token).await);
    assert_eq!(err, AuthError::TokenRevoked);

    // Rotation also retires the old access token.
    let err = auth_error(t.core.authenticate(&first.access_token).await);
    assert_eq!(err, AuthError::SessionNotFound);
    assert!(t.core.authenticate(&second.access_token).await.is_ok());

    let third = t.core.refresh(&second.refresh_token).await.unwrap();
    assert!(t.core.authenticate(&third.access_token).await.is_ok());
}

#[tokio::test]
async fn test_logout_then_refresh_is_rejected() {
    let t = TestCore::new();
    t.register("alice").await;
    let pair = t.core.login("alice", PASSWORD, "10.0.5.1").await.unwrap();

    assert_eq!(t.core.logout(&pair.access_token).await.unwrap(), 1);

    let err = auth_error(t.core.refresh(&pair.refresh_token).await);
    assert!(matches!(err, AuthError::TokenRevoked | AuthError::SessionNotFound));
    let err = auth_error(t.core.authenticate(&pair.access_token).await);
    assert_eq!(err, AuthError::SessionNotFound);
}

#[tokio::test]
async fn test_logout_ends_every_session() {
    let t = TestCore::new();
    t.register("alice").await;
    let laptop = t.core.login("alice", PASSWORD, "10.0.6.1").await.unwrap();
    let phone = t.core.login("alice", PASSWORD, "10.0.6.2").await.unwrap();

    assert_eq!(t.core.logout(&phone.access_token).await.unwrap(), 2);
    let err = auth_error(t.core.refresh(&laptop.refresh_token).await);
    assert_eq!(err, AuthError::TokenRevoked);
}

#[tokio::test]
async fn test_token_types_are_not_interchangeable() {
    let t = TestCore::new();
    t.register("alice").await;
    let pair = t.core.login("alice", PASSWORD, "10.0.7.1").await.unwrap();

    let err = auth_error(t.core.refresh(&pair.access_token).await);
    assert_eq!(err, AuthError::TokenTypeMismatch);
    let err = auth_error(t.core.logout(&pair.refresh_token).await);
    assert_eq!(err, AuthError::TokenTypeMismatch);
    let err = auth_error(t.core.refresh("garbage").await);
    assert_eq!(err, AuthError::TokenInvalid);
}

#[tokio::test]
async fn test_expired_tokens() {
    let t = TestCore::new();
    t.register("alice").await;
    let pair = t.core.login("alice", PASSWORD, "10.0.8.1").await.unwrap();

    t.clock.advance(Duration::minutes(16));
    let err = auth_error(t.core.authenticate(&pair.access_token).await);
    assert_eq!(err, AuthError::TokenExpired);
    let fresh = t.core.refresh(&pair.refresh_token).await.unwrap();

    t.clock.advance(Duration::days(8));
    let err = auth_error(t.core.refresh(&fresh.refresh_token).await);
    assert_eq!(err, AuthError::TokenExpired);
}

#[tokio::test]
async fn test_refresh_refused_while_locked() {
    let t = TestCore::new();
    t.register("alice").await;
    let pair = t.core.login("alice", PASSWORD, "10.0.9.1").await.unwrap();

    for i in 2..=6 {
        let _ = t.core.login("alice", WRONG, &format!("10.0.9.{}", i)).await;
    }
    let err = auth_error(t.core.refresh(&pair.refresh_token).await);
    assert!(matches!(err, AuthError::AccountLocked { .. }));

    t.clock.advance(Duration::minutes(31));
    assert!(t.core.refresh(&pair.refresh_token).await.is_ok());
}

#[test_log::test(tokio::test)]
async fn test_password_reset_revokes_all_sessions() {
    let t = TestCore::new();
    t.register("alice").await;
    let laptop = t.core.login("alice", PASSWORD, "10.0.10.1").await.unwrap();
    let phone = t.core.login("alice", PASSWORD, "10.0.10.2").await.unwrap();

    t.core
        .request_password_reset("alice@example.com", "10.0.10.3")
        .await
        .unwrap();
    let token = t.next_reset_token().await;

    t.core.confirm_password_reset(&token, "N3w#Password").await.unwrap();

    for pair in [&laptop, &phone] {
        let err = auth_error(t.core.refresh(&pair.refresh_token).await);
        assert_eq!(err, AuthError::TokenRevoked);
        let err = auth_error(t.core.authenticate(&pair.access_token).await);
        assert_eq!(err, AuthError::SessionNotFound);
    }

    let err = auth_error(t.core.login("alice", PASSWORD, "10.0.10.4").await);
    assert_eq!(err, AuthError::InvalidCredentials);
    assert!(t.core.login("alice", "N3w#Password", "10.0.10.5").await.is_ok());

    // Reset tokens are single use.
    let err = auth_error(t.core.confirm_password_reset(&token, "Other#Pass1").await);
    assert_eq!(err, AuthError::TokenInvalid);
}

#[tokio::test]
async fn test_reset_request_for_unknown_email_is_silent() {
    let t = TestCore::new();
    t.core
        .request_password_reset("nobody@example.com", "10.0.11.1")
        .await
        .unwrap();

    for _ in 0..2 {
        t.core
            .request_password_reset("nobody@example.com", "10.0.11.1")
            .await
            .unwrap();
    }
    let err = auth_error(
        t.core
            .request_password_reset("nobody@example.com", "10.0.11.1")
            .await,
    );
    assert_eq!(err, AuthError::RateLimited);
}

#[tokio::test]
async fn test_email_verification_required_for_login() {
    let mut settings = Settings::new_for_test().unwrap();
    settings.auth.require_verified_email = true;
    let t = TestCore::with_settings(settings);
    t.register("alice").await;

    // Wrong passwords are still reported as such, so this reveals nothing about the account.
    let err = auth_error(t.core.login("alice", WRONG, "10.0.12.1").await);
    assert_eq!(err, AuthError::InvalidCredentials);
    let err = auth_error(t.core.login("alice", PASSWORD, "10.0.12.2").await);
    assert_eq!(err, AuthError::EmailNotVerified);

    let token = t.next_verification_token().await;
    t.core.verify_email(&token).await.unwrap();
    let pair = t.core.login("alice", PASSWORD, "10.0.12.3").await.unwrap();

    let me = t.core.authenticate(&pair.access_token).await.unwrap();
    assert!(me.is_verified);
}

#[tokio::test]
async fn test_verification_token_expires() {
    let t = TestCore::new();
    t.register("alice").await;
    let token = t.next_verification_token().await;

    t.clock.advance(Duration::hours(25));
    let err = auth_error(t.core.verify_email(&token).await);
    assert_eq!(err, AuthError::TokenExpired);
}

#[tokio::test]
async fn test_concurrent_failures_never_undercount() {
    let t = TestCore::new();
    let identity = t.register("alice").await;

    let mut handles = Vec::new();
    for i in 0..10 {
        let core = t.core.clone();
        handles.push(tokio::spawn(async move {
            core.login("alice", WRONG, &format!("10.0.13.{}", i)).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_err());
    }

    // Attempts that arrive after the lock are refused without being counted.
    assert!(t.store.failed_attempt_count().await >= 5);
    let stored = t.store.find_identity_by_id(identity.id).await.unwrap().unwrap();
    assert!(matches!(stored.lock_state(), LockState::Locked { .. }));
}

#[tokio::test]
async fn test_concurrent_refresh_has_single_winner() {
    let t = TestCore::new();
    t.register("alice").await;
    let pair = t.core.login("alice", PASSWORD, "10.0.14.1").await.unwrap();

    let attempts = (0..8).map(|_| t.core.refresh(&pair.refresh_token));
    let results = futures::future::join_all(attempts).await;

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    assert_eq!(t.store.session_count().await, 1);
}

#[tokio::test]
async fn test_access_token_subject_is_identity_id() {
    let t = TestCore::new();
    let identity = t.register("alice").await;
    let pair = t.core.login("alice", PASSWORD, "10.0.15.1").await.unwrap();

    let settings = Settings::new_for_test().unwrap();
    let issuer = authgate_server::auth::TokenIssuer::new(
        &settings.auth,
        std::sync::Arc::new(t.clock.clone()),
    );
    let subject = issuer.verify(&pair.access_token, TokenType::Access).unwrap();
    assert_eq!(Uuid::parse_str(&subject).unwrap(), identity.id);
}
