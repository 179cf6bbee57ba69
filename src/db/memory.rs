use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::models::{
    ConsumeOutcome, FailedAttemptRecord, Identity, OneTimeToken, OneTimeTokenKind,
    RevokedTokenEntry, Role, Session,
};
use crate::db::store::{AuthStore, StoreResult};
use crate::error::DatabaseError;

#[derive(Default)]
struct Tables {
    identities: HashMap<Uuid, Identity>,
    sessions: HashMap<Uuid, Session>,
    revoked: HashMap<String, RevokedTokenEntry>,
    attempts: Vec<FailedAttemptRecord>,
    one_time: HashMap<String, OneTimeToken>,
}

/// Process-local store. Every operation runs under one lock, which makes each
/// trait method atomic with respect to every other.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn session_count(&self) -> usize {
        self.tables.read().await.sessions.len()
    }

    pub async fn failed_attempt_count(&self) -> usize {
        self.tables.read().await.attempts.len()
    }

    pub async fn revoked_token_count(&self) -> usize {
        self.tables.read().await.revoked.len()
    }
}

#[async_trait]
impl AuthStore for MemoryStore {
    async fn insert_identity(&self, identity: &Identity) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let taken = tables
            .identities
            .values()
            .any(|i| i.username == identity.username || i.email == identity.email);
        if taken || tables.identities.contains_key(&identity.id) {
            return Err(DatabaseError::Duplicate);
        }
        tables.identities.insert(identity.id, identity.clone());
        Ok(())
    }

    async fn find_identity_by_id(&self, id: Uuid) -> StoreResult<Option<Identity>> {
        Ok(self.tables.read().await.identities.get(&id).cloned())
    }

    async fn find_identity_by_username(&self, username: &str) -> StoreResult<Option<Identity>> {
        let tables = self.tables.read().await;
        Ok(tables
            .identities
            .values()
            .find(|i| i.username == username)
            .cloned())
    }

    async fn find_identity_by_email(&self, email: &str) -> StoreResult<Option<Identity>> {
        let tables = self.tables.read().await;
        Ok(tables.identities.values().find(|i| i.email == email).cloned())
    }

    async fn update_password_hash(&self, id: Uuid, password_hash: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let identity = tables.identities.get_mut(&id).ok_or(DatabaseError::NotFound)?;
        identity.password_hash = password_hash.to_string();
        Ok(())
    }

    async fn mark_verified(&self, id: Uuid) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let identity = tables.identities.get_mut(&id).ok_or(DatabaseError::NotFound)?;
        identity.is_verified = true;
        Ok(())
    }

    async fn record_login(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let identity = tables.identities.get_mut(&id).ok_or(DatabaseError::NotFound)?;
        identity.last_login = Some(at);
        Ok(())
    }

    async fn lock_identity(&self, id: Uuid, until: DateTime<Utc>) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let identity = tables.identities.get_mut(&id).ok_or(DatabaseError::NotFound)?;
        identity.is_locked = true;
        identity.locked_until = Some(until);
        Ok(())
    }

    async fn clear_expired_lock(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let identity = tables.identities.get_mut(&id).ok_or(DatabaseError::NotFound)?;
        match identity.locked_until {
            Some(until) if identity.is_locked && now > until => {
                identity.is_locked = false;
                identity.locked_until = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn assign_role(&self, id: Uuid, role: Role) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let identity = tables.identities.get_mut(&id).ok_or(DatabaseError::NotFound)?;
        if !identity.roles.contains(&role) {
            identity.roles.push(role);
            identity.roles.sort();
        }
        Ok(())
    }

    async fn insert_session(&self, session: &Session) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let clash = tables.sessions.values().any(|s| {
            s.refresh_token == session.refresh_token || s.access_token == session.access_token
        });
        if clash {
            return Err(DatabaseError::Duplicate);
        }
        tables.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn find_live_session_by_refresh(&self, refresh_token: &str) -> StoreResult<Option<Session>> {
        let tables = self.tables.read().await;
        Ok(tables
            .sessions
            .values()
            .find(|s| !s.is_revoked && s.refresh_token == refresh_token)
            .cloned())
    }

    async fn find_live_session_by_access(&self, access_token: &str) -> StoreResult<Option<Session>> {
        let tables = self.tables.read().await;
        Ok(tables
            .sessions
            .values()
            .find(|s| !s.is_revoked && s.access_token == access_token)
            .cloned())
    }

    async fn replace_session_tokens(
        &self,
        session_id: Uuid,
        expected_refresh: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.sessions.get_mut(&session_id) {
            Some(session) if !session.is_revoked && session.refresh_token == expected_refresh => {
                session.access_token = access_token.to_string();
                session.refresh_token = refresh_token.to_string();
                session.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_sessions_for_identity(&self, identity_id: Uuid) -> StoreResult<Vec<Session>> {
        let mut tables = self.tables.write().await;
        let mut revoked = Vec::new();
        for session in tables.sessions.values_mut() {
            if session.identity_id == identity_id && !session.is_revoked {
                revoked.push(session.clone());
                session.is_revoked = true;
            }
        }
        Ok(revoked)
    }

    async fn insert_revoked_token(&self, entry: &RevokedTokenEntry) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables
            .revoked
            .entry(entry.token_hash.clone())
            .or_insert_with(|| entry.clone());
        Ok(())
    }

    async fn find_revoked_token(&self, token_hash: &str) -> StoreResult<Option<RevokedTokenEntry>> {
        Ok(self.tables.read().await.revoked.get(token_hash).cloned())
    }

    async fn purge_revoked_tokens(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.revoked.len();
        tables.revoked.retain(|_, entry| entry.expires_at > now);
        Ok((before - tables.revoked.len()) as u64)
    }

    async fn record_failed_attempt(
        &self,
        record: &FailedAttemptRecord,
        window_start: DateTime<Utc>,
    ) -> StoreResult<u32> {
        let mut tables = self.tables.write().await;
        tables.attempts.push(record.clone());
        let count = tables
            .attempts
            .iter()
            .filter(|a| a.username == record.username && a.attempted_at >= window_start)
            .count();
        Ok(count as u32)
    }

    async fn purge_failed_attempts(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let mut tables = self.tables.write().await;
        let len = tables.attempts.len();
        tables.attempts.retain(|a| a.attempted_at >= before);
        Ok((len - tables.attempts.len()) as u64)
    }

    async fn insert_one_time_token(&self, token: &OneTimeToken) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.one_time.contains_key(&token.token_hash) {
            return Err(DatabaseError::Duplicate);
        }
        tables.one_time.insert(token.token_hash.clone(), token.clone());
        Ok(())
    }

    async fn consume_one_time_token(
        &self,
        token_hash: &str,
        kind: OneTimeTokenKind,
        now: DateTime<Utc>,
    ) -> StoreResult<ConsumeOutcome> {
        let mut tables = self.tables.write().await;
        let Some(token) = tables.one_time.get_mut(token_hash) else {
            return Ok(ConsumeOutcome::NotFound);
        };
        if token.kind != kind || token.is_used {
            return Ok(ConsumeOutcome::NotFound);
        }
        if now > token.expires_at {
            return Ok(ConsumeOutcome::Expired);
        }
        token.is_used = true;
        Ok(ConsumeOutcome::Consumed {
            identity_id: token.identity_id,
        })
    }

    async fn delete_unused_one_time_tokens(
        &self,
        identity_id: Uuid,
        kind: OneTimeTokenKind,
    ) -> StoreResult<u64> {
        let mut tables = self.tables.write().await;
        let len = tables.one_time.len();
        tables
            .one_time
            .retain(|_, t| !(t.identity_id == identity_id && t.kind == kind && !t.is_used));
        Ok((len - tables.one_time.len()) as u64)
    }
}
