//! Persistence contract consumed by the auth core.
//!
//! Every mutation that can race with another request is expressed as a
//! single conditional operation here, so implementations can make it atomic
//! (a row-level compare-and-swap in Postgres, one lock acquisition in memory).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::models::{
    ConsumeOutcome, FailedAttemptRecord, Identity, OneTimeToken, OneTimeTokenKind,
    RevokedTokenEntry, Role, Session,
};
use crate::error::DatabaseError;

pub type StoreResult<T> = std::result::Result<T, DatabaseError>;

#[async_trait]
pub trait AuthStore: Send + Sync {
    /// Fails with [`DatabaseError::Duplicate`] when the username or email is
    /// taken. The identity's roles are stored with it. Finders return
    /// identities with their roles loaded.
    async fn insert_identity(&self, identity: &Identity) -> StoreResult<()>;
    async fn find_identity_by_id(&self, id: Uuid) -> StoreResult<Option<Identity>>;
    async fn find_identity_by_username(&self, username: &str) -> StoreResult<Option<Identity>>;
    async fn find_identity_by_email(&self, email: &str) -> StoreResult<Option<Identity>>;
    async fn update_password_hash(&self, id: Uuid, password_hash: &str) -> StoreResult<()>;
    async fn mark_verified(&self, id: Uuid) -> StoreResult<()>;
    async fn record_login(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;
    async fn lock_identity(&self, id: Uuid, until: DateTime<Utc>) -> StoreResult<()>;
    /// Clears the lock only if it has a deadline that is before `now`.
    /// Returns whether a lock was cleared.
    async fn clear_expired_lock(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool>;
    /// Granting a role the identity already holds is not an error.
    /// Fails with [`DatabaseError::NotFound`] for an unknown identity.
    async fn assign_role(&self, id: Uuid, role: Role) -> StoreResult<()>;

    async fn insert_session(&self, session: &Session) -> StoreResult<()>;
    async fn find_live_session_by_refresh(&self, refresh_token: &str) -> StoreResult<Option<Session>>;
    async fn find_live_session_by_access(&self, access_token: &str) -> StoreResult<Option<Session>>;
    /// Swaps the token pair only while the session is unrevoked and still
    /// carries `expected_refresh`. Returns `false` when another operation won.
    async fn replace_session_tokens(
        &self,
        session_id: Uuid,
        expected_refresh: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<bool>;
    /// Marks every live session of the identity revoked and returns them as
    /// they were just before revocation.
    async fn revoke_sessions_for_identity(&self, identity_id: Uuid) -> StoreResult<Vec<Session>>;

    /// Idempotent: inserting an already revoked digest is not an error.
    async fn insert_revoked_token(&self, entry: &RevokedTokenEntry) -> StoreResult<()>;
    async fn find_revoked_token(&self, token_hash: &str) -> StoreResult<Option<RevokedTokenEntry>>;
    async fn purge_revoked_tokens(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    /// Appends the record and returns how many attempts for the same username
    /// fall at or after `window_start`, including this one, as one atomic step.
    async fn record_failed_attempt(
        &self,
        record: &FailedAttemptRecord,
        window_start: DateTime<Utc>,
    ) -> StoreResult<u32>;
    async fn purge_failed_attempts(&self, before: DateTime<Utc>) -> StoreResult<u64>;

    async fn insert_one_time_token(&self, token: &OneTimeToken) -> StoreResult<()>;
    /// Marks the token used if it is unused and unexpired.
    async fn consume_one_time_token(
        &self,
        token_hash: &str,
        kind: OneTimeTokenKind,
        now: DateTime<Utc>,
    ) -> StoreResult<ConsumeOutcome>;
    async fn delete_unused_one_time_tokens(
        &self,
        identity_id: Uuid,
        kind: OneTimeTokenKind,
    ) -> StoreResult<u64>;
}
