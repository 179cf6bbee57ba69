use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use url::Url;

use super::Notifier;
use crate::db::IdentityView;
use crate::error::{AppError, NotifyError};

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Message<'a> {
    Lockout { email: &'a str, username: &'a str },
    Verification { email: &'a str, token: &'a str },
    PasswordReset { email: &'a str, token: &'a str },
}

/// Posts notifications as JSON to a mail relay.
#[derive(Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpNotifier {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, AppError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| AppError::ConfigError(format!("Invalid notifier endpoint: {}", e)))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::InternalError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, endpoint })
    }

    async fn post(&self, message: &Message<'_>) -> Result<(), NotifyError> {
        let response = self.client.post(self.endpoint.clone()).json(message).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send_lockout_notice(&self, identity: &IdentityView) -> Result<(), NotifyError> {
        self.post(&Message::Lockout {
            email: &identity.email,
            username: &identity.username,
        })
        .await
    }

    async fn send_verification(&self, email: &str, token: &str) -> Result<(), NotifyError> {
        self.post(&Message::Verification { email, token }).await
    }

    async fn send_password_reset(&self, email: &str, token: &str) -> Result<(), NotifyError> {
        self.post(&Message::PasswordReset { email, token }).await
    }
}
