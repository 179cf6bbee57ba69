use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::db::models::{
    ConsumeOutcome, FailedAttemptRecord, Identity, OneTimeToken, OneTimeTokenKind,
    RevokedTokenEntry, Role, Session,
};
use crate::db::store::{AuthStore, StoreResult};
use crate::error::DatabaseError;

const IDENTITY_COLUMNS: &str =
    "id, username, email, password_hash, is_verified, is_locked, locked_until, created_at, last_login";
const SESSION_COLUMNS: &str =
    "id, identity_id, access_token, refresh_token, created_at, expires_at, is_revoked";

/// Postgres-backed [`AuthStore`].
#[derive(Clone)]
pub struct DbOperations {
    pool: Arc<PgPool>,
}

impl DbOperations {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn new_with_options(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        Ok(Self { pool: Arc::new(pool) })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(self.pool.as_ref()).await
    }

    pub async fn begin_transaction(&self) -> StoreResult<Transaction<'_, Postgres>> {
        Ok(self.pool.as_ref().begin().await?)
    }

    async fn find_identity_where(&self, column: &str, value: &str) -> StoreResult<Option<Identity>> {
        let query = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE {column} = $1");
        let identity = sqlx::query_as::<_, Identity>(&query)
            .bind(value)
            .fetch_optional(self.pool.as_ref())
            .await?;

        self.with_roles(identity).await
    }

    async fn with_roles(&self, identity: Option<Identity>) -> StoreResult<Option<Identity>> {
        let Some(mut identity) = identity else {
            return Ok(None);
        };

        let rows = sqlx::query("SELECT role FROM identity_roles WHERE identity_id = $1")
            .bind(identity.id)
            .fetch_all(self.pool.as_ref())
            .await?;

        let mut roles = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("role")?;
            roles.push(name.parse::<Role>().map_err(DatabaseError::QueryError)?);
        }
        roles.sort();
        identity.roles = roles;

        Ok(Some(identity))
    }

    async fn find_live_session_where(&self, column: &str, token: &str) -> StoreResult<Option<Session>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE {column} = $1 AND NOT is_revoked"
        );
        let session = sqlx::query_as::<_, Session>(&query)
            .bind(token)
            .fetch_optional(self.pool.as_ref())
            .await?;

        Ok(session)
    }
}

#[async_trait]
impl AuthStore for DbOperations {
    async fn insert_identity(&self, identity: &Identity) -> StoreResult<()> {
        let mut transaction = self.begin_transaction().await?;

        sqlx::query(
            r#"
            INSERT INTO identities
                (id, username, email, password_hash, is_verified, is_locked, locked_until, created_at, last_login)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(identity.id)
        .bind(&identity.username)
        .bind(&identity.email)
        .bind(&identity.password_hash)
        .bind(identity.is_verified)
        .bind(identity.is_locked)
        .bind(identity.locked_until)
        .bind(identity.created_at)
        .bind(identity.last_login)
        .execute(&mut *transaction)
        .await?;

        for role in &identity.roles {
            sqlx::query("INSERT INTO identity_roles (identity_id, role) VALUES ($1, $2)")
                .bind(identity.id)
                .bind(role.as_str())
                .execute(&mut *transaction)
                .await?;
        }

        transaction.commit().await?;
        Ok(())
    }

    async fn find_identity_by_id(&self, id: Uuid) -> StoreResult<Option<Identity>> {
        let query = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = $1");
        let identity = sqlx::query_as::<_, Identity>(&query)
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await?;

        self.with_roles(identity).await
    }

    async fn find_identity_by_username(&self, username: &str) -> StoreResult<Option<Identity>> {
        self.find_identity_where("username", username).await
    }

    async fn find_identity_by_email(&self, email: &str) -> StoreResult<Option<Identity>> {
        self.find_identity_where("email", email).await
    }

    async fn update_password_hash(&self, id: Uuid, password_hash: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE identities SET password_hash = $1 WHERE id = $2")
            .bind(password_hash)
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound);
        }
        Ok(())
    }

    async fn mark_verified(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE identities SET is_verified = TRUE WHERE id = $1")
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }

    async fn record_login(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE identities SET last_login = $1 WHERE id = $2")
            .bind(at)
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }

    async fn lock_identity(&self, id: Uuid, until: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE identities SET is_locked = TRUE, locked_until = $1 WHERE id = $2")
            .bind(until)
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }

    async fn clear_expired_lock(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE identities SET is_locked = FALSE, locked_until = NULL
            WHERE id = $1 AND is_locked AND locked_until IS NOT NULL AND locked_until < $2
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn assign_role(&self, id: Uuid, role: Role) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO identity_roles (identity_id, role)
            SELECT id, $2 FROM identities WHERE id = $1
            ON CONFLICT (identity_id, role) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(role.as_str())
        .execute(self.pool.as_ref())
        .await?;

        if result.rows_affected() == 0 && self.find_identity_by_id(id).await?.is_none() {
            return Err(DatabaseError::NotFound);
        }
        Ok(())
    }

    async fn insert_session(&self, session: &Session) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions
                (id, identity_id, access_token, refresh_token, created_at, expires_at, is_revoked)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(session.id)
        .bind(session.identity_id)
        .bind(&session.access_token)
        .bind(&session.refresh_token)
        .bind(session.created_at)
        .bind(session.expires_at)
        .bind(session.is_revoked)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn find_live_session_by_refresh(&self, refresh_token: &str) -> StoreResult<Option<Session>> {
        self.find_live_session_where("refresh_token", refresh_token).await
    }

    async fn find_live_session_by_access(&self, access_token: &str) -> StoreResult<Option<Session>> {
        self.find_live_session_where("access_token", access_token).await
    }

    async fn replace_session_tokens(
        &self,
        session_id: Uuid,
        expected_refresh: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET access_token = $1, refresh_token = $2, expires_at = $3
            WHERE id = $4 AND refresh_token = $5 AND NOT is_revoked
            "#,
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at)
        .bind(session_id)
        .bind(expected_refresh)
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn revoke_sessions_for_identity(&self, identity_id: Uuid) -> StoreResult<Vec<Session>> {
        let query = format!(
            "UPDATE sessions SET is_revoked = TRUE WHERE identity_id = $1 AND NOT is_revoked RETURNING {SESSION_COLUMNS}"
        );
        let sessions = sqlx::query_as::<_, Session>(&query)
            .bind(identity_id)
            .fetch_all(self.pool.as_ref())
            .await?;

        Ok(sessions)
    }

    async fn insert_revoked_token(&self, entry: &RevokedTokenEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO revoked_tokens (token_hash, revoked_at, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (token_hash) DO NOTHING
            "#,
        )
        .bind(&entry.token_hash)
        .bind(entry.revoked_at)
        .bind(entry.expires_at)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn find_revoked_token(&self, token_hash: &str) -> StoreResult<Option<RevokedTokenEntry>> {
        let entry = sqlx::query_as::<_, RevokedTokenEntry>(
            "SELECT token_hash, revoked_at, expires_at FROM revoked_tokens WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(entry)
    }

    async fn purge_revoked_tokens(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM revoked_tokens WHERE expires_at <= $1")
            .bind(now)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected())
    }

    async fn record_failed_attempt(
        &self,
        record: &FailedAttemptRecord,
        window_start: DateTime<Utc>,
    ) -> StoreResult<u32> {
        let mut transaction = self.begin_transaction().await?;

        // Serialises concurrent failures for one username so each count sees
        // every earlier insert.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&record.username)
            .execute(&mut *transaction)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO failed_login_attempts (id, username, source_address, attempted_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(record.id)
        .bind(&record.username)
        .bind(&record.source_address)
        .bind(record.attempted_at)
        .execute(&mut *transaction)
        .await?;

        let row = sqlx::query(
            "SELECT COUNT(*) AS attempts FROM failed_login_attempts WHERE username = $1 AND attempted_at >= $2",
        )
        .bind(&record.username)
        .bind(window_start)
        .fetch_one(&mut *transaction)
        .await?;

        transaction.commit().await?;

        let attempts: i64 = row.try_get("attempts")?;
        Ok(u32::try_from(attempts).unwrap_or(u32::MAX))
    }

    async fn purge_failed_attempts(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM failed_login_attempts WHERE attempted_at < $1")
            .bind(before)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected())
    }

    async fn insert_one_time_token(&self, token: &OneTimeToken) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO one_time_tokens (id, identity_id, token_hash, kind, created_at, expires_at, is_used)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(token.id)
        .bind(token.identity_id)
        .bind(&token.token_hash)
        .bind(token.kind.as_str())
        .bind(token.created_at)
        .bind(token.expires_at)
        .bind(token.is_used)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn consume_one_time_token(
        &self,
        token_hash: &str,
        kind: OneTimeTokenKind,
        now: DateTime<Utc>,
    ) -> StoreResult<ConsumeOutcome> {
        let consumed = sqlx::query(
            r#"
            UPDATE one_time_tokens SET is_used = TRUE
            WHERE token_hash = $1 AND kind = $2 AND NOT is_used AND expires_at >= $3
            RETURNING identity_id
            "#,
        )
        .bind(token_hash)
        .bind(kind.as_str())
        .bind(now)
        .fetch_optional(self.pool.as_ref())
        .await?;

        if let Some(row) = consumed {
            return Ok(ConsumeOutcome::Consumed {
                identity_id: row.try_get("identity_id")?,
            });
        }

        let pending = sqlx::query(
            "SELECT 1 FROM one_time_tokens WHERE token_hash = $1 AND kind = $2 AND NOT is_used",
        )
        .bind(token_hash)
        .bind(kind.as_str())
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(match pending {
            Some(_) => ConsumeOutcome::Expired,
            None => ConsumeOutcome::NotFound,
        })
    }

    async fn delete_unused_one_time_tokens(
        &self,
        identity_id: Uuid,
        kind: OneTimeTokenKind,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM one_time_tokens WHERE identity_id = $1 AND kind = $2 AND NOT is_used",
        )
        .bind(identity_id)
        .bind(kind.as_str())
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected())
    }
}
