use authgate_server::auth::RateLimiter;
use authgate_server::clock::{Clock, SystemClock};
use authgate_server::db::{IdentityView, MemoryStore, Role};
use authgate_server::error::NotifyError;
use authgate_server::notify::{HttpNotifier, Notifier};
use authgate_server::{AuthCore, Settings};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn notifier_for(server: &MockServer) -> HttpNotifier {
    HttpNotifier::new(&format!("{}/notify", server.uri()), Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn test_posts_password_reset() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/notify"))
        .and(body_partial_json(json!({
            "kind": "password_reset",
            "email": "erin@example.com",
            "token": "reset-token"
        })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    notifier_for(&server)
        .send_password_reset("erin@example.com", "reset-token")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_lockout_notice_carries_no_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/notify"))
        .and(body_partial_json(json!({ "kind": "lockout", "username": "frank" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let identity = IdentityView {
        id: Uuid::new_v4(),
        username: "frank".into(),
        email: "frank@example.com".into(),
        is_verified: true,
        is_locked: true,
        created_at: Utc::now(),
        last_login: None,
        roles: vec![Role::User],
    };
    notifier_for(&server).send_lockout_notice(&identity).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert!(body.get("token").is_none());
}

#[tokio::test]
async fn test_relay_rejection_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = notifier_for(&server)
        .send_verification("gina@example.com", "token")
        .await
        .unwrap_err();
    assert!(matches!(err, NotifyError::Rejected(503)));
}

#[tokio::test]
async fn test_unreachable_relay_does_not_fail_registration() {
    let notifier = HttpNotifier::new("http://127.0.0.1:1/notify", Duration::from_millis(200)).unwrap();
    let settings = Settings::new_for_test().unwrap();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let core = AuthCore::new(
        &settings,
        Arc::new(MemoryStore::new()),
        Arc::new(RateLimiter::local(clock.clone())),
        Arc::new(notifier),
        clock,
    )
    .unwrap();

    let identity = core
        .register("hank", "hank@example.com", "Str0ng#Pass", "192.0.2.1")
        .await
        .unwrap();
    assert_eq!(identity.username, "hank");
}

#[tokio::test]
async fn test_registration_delivers_verification_through_relay() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/notify"))
        .and(body_partial_json(json!({ "kind": "verification", "email": "ivy@example.com" })))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let settings = Settings::new_for_test().unwrap();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let core = AuthCore::new(
        &settings,
        Arc::new(MemoryStore::new()),
        Arc::new(RateLimiter::local(clock.clone())),
        Arc::new(notifier_for(&server)),
        clock,
    )
    .unwrap();
    core.register("ivy", "ivy@example.com", "Str0ng#Pass", "192.0.2.1")
        .await
        .unwrap();

    // Delivery runs on a spawned task.
    let mut delivered = Vec::new();
    for _ in 0..50 {
        delivered = server.received_requests().await.unwrap();
        if !delivered.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(delivered.len(), 1);

    let body: serde_json::Value = serde_json::from_slice(&delivered[0].body).unwrap();
    let token = body["token"].as_str().unwrap();
    assert_eq!(token.len(), 64);
    core.verify_email(token).await.unwrap();
}
