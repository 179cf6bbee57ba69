//! Server-side session tracking and refresh-token revocation.
//!
//! A session holds the live token pair of one login. Rotation swaps the pair
//! with a compare-and-swap on the presented refresh token, so of two
//! concurrent refreshes with the same token at most one succeeds. Every
//! refresh token that leaves service (rotated away or revoked at logout) is
//! recorded by digest until its own expiry, so replaying it is detected.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::token::{digest_token, TokenIssuer, TokenPair};
use crate::clock::Clock;
use crate::db::{AuthStore, RevokedTokenEntry, Session};
use crate::error::{AppError, AuthError};

pub struct TokenRevocationRegistry {
    store: Arc<dyn AuthStore>,
    clock: Arc<dyn Clock>,
}

impl TokenRevocationRegistry {
    pub fn new(store: Arc<dyn AuthStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Idempotent. `expires_at` is the token's own expiry, after which the
    /// entry may be purged.
    pub async fn revoke(&self, token: &str, expires_at: DateTime<Utc>) -> Result<(), AppError> {
        let entry = RevokedTokenEntry {
            token_hash: digest_token(token),
            revoked_at: self.clock.now(),
            expires_at,
        };
        self.store.insert_revoked_token(&entry).await?;
        Ok(())
    }

    pub async fn is_revoked(&self, token: &str) -> Result<bool, AppError> {
        Ok(self
            .store
            .find_revoked_token(&digest_token(token))
            .await?
            .is_some())
    }

    pub async fn purge_expired(&self) -> Result<u64, AppError> {
        let purged = self.store.purge_revoked_tokens(self.clock.now()).await?;
        if purged > 0 {
            debug!(purged, "Purged expired revocation entries");
        }
        Ok(purged)
    }
}

pub struct SessionRegistry {
    store: Arc<dyn AuthStore>,
    issuer: Arc<TokenIssuer>,
    revocations: Arc<TokenRevocationRegistry>,
    clock: Arc<dyn Clock>,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn AuthStore>,
        issuer: Arc<TokenIssuer>,
        revocations: Arc<TokenRevocationRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            issuer,
            revocations,
            clock,
        }
    }

    pub async fn create_session(
        &self,
        identity_id: Uuid,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Session, AppError> {
        let session = Session::new(
            identity_id,
            access_token.to_string(),
            refresh_token.to_string(),
            self.clock.now(),
            expires_at,
        );
        self.store.insert_session(&session).await?;
        Ok(session)
    }

    /// Issues a fresh pair for the identity and records it as a new session.
    pub async fn open(&self, identity_id: Uuid) -> Result<TokenPair, AppError> {
        let pair = self.issuer.issue_pair(&identity_id.to_string())?;
        let expires_at = self.clock.now() + self.issuer.refresh_ttl();
        let session = self
            .create_session(identity_id, &pair.access_token, &pair.refresh_token, expires_at)
            .await?;
        debug!(session_id = %session.id, identity_id = %identity_id, "Session opened");
        Ok(pair)
    }

    /// Replaces the session's pair. The presented refresh token is retired
    /// whether or not this call wins the swap.
    pub async fn rotate(&self, refresh_token: &str) -> Result<TokenPair, AppError> {
        let session = self
            .store
            .find_live_session_by_refresh(refresh_token)
            .await?
            .ok_or(AuthError::SessionNotFound)?;

        let now = self.clock.now();
        if session.is_expired(now) {
            return Err(AuthError::SessionNotFound.into());
        }

        self.revocations.revoke(refresh_token, session.expires_at).await?;

        let pair = self.issuer.issue_pair(&session.identity_id.to_string())?;
        let expires_at = now + self.issuer.refresh_ttl();
        let swapped = self
            .store
            .replace_session_tokens(
                session.id,
                refresh_token,
                &pair.access_token,
                &pair.refresh_token,
                expires_at,
            )
            .await?;

        if !swapped {
            warn!(
                target: "auth.token.refresh",
                session_id = %session.id,
                "Lost rotation race for session"
            );
            return Err(AuthError::SessionNotFound.into());
        }

        info!(
            target: "auth.token.refresh",
            session_id = %session.id,
            identity_id = %session.identity_id,
            "Session tokens rotated"
        );
        Ok(pair)
    }

    /// Live session currently holding this access token, if any.
    pub async fn find_by_access(&self, access_token: &str) -> Result<Option<Session>, AppError> {
        let session = self.store.find_live_session_by_access(access_token).await?;
        let now = self.clock.now();
        Ok(session.filter(|s| !s.is_expired(now)))
    }

    /// Revokes every live session of the identity and retires their refresh
    /// tokens. Returns how many sessions were revoked.
    pub async fn revoke_all_for_identity(&self, identity_id: Uuid) -> Result<usize, AppError> {
        let sessions = self.store.revoke_sessions_for_identity(identity_id).await?;
        for session in &sessions {
            self.revocations
                .revoke(&session.refresh_token, session.expires_at)
                .await?;
        }
        Ok(sessions.len())
    }
}
