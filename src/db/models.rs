use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Moderator,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Moderator => "moderator",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "moderator" => Ok(Role::Moderator),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role {:?}", other)),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, FromRow)]
pub struct Identity {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_verified: bool,
    pub is_locked: bool,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    /// Loaded from `identity_roles`, not a column of `identities`.
    #[sqlx(skip)]
    #[serde(default)]
    pub roles: Vec<Role>,
}

impl Identity {
    /// New identities carry the `user` role.
    pub fn new(username: String, email: String, password_hash: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            username,
            email,
            password_hash,
            is_verified: false,
            is_locked: false,
            locked_until: None,
            created_at: now,
            last_login: None,
            roles: vec![Role::User],
        }
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn lock_state(&self) -> LockState {
        if self.is_locked {
            LockState::Locked {
                until: self.locked_until,
            }
        } else {
            LockState::Unlocked
        }
    }

    pub fn view(&self) -> IdentityView {
        IdentityView {
            id: self.id,
            username: self.username.clone(),
            email: self.email.clone(),
            is_verified: self.is_verified,
            is_locked: self.is_locked,
            created_at: self.created_at,
            last_login: self.last_login,
            roles: self.roles.clone(),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("email", &self.email)
            .field("password_hash", &"<redacted>")
            .field("is_verified", &self.is_verified)
            .field("is_locked", &self.is_locked)
            .field("locked_until", &self.locked_until)
            .field("roles", &self.roles)
            .finish()
    }
}

/// What the API layer is allowed to see of an identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityView {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub is_verified: bool,
    pub is_locked: bool,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    pub roles: Vec<Role>,
}

/// Per-identity lockout state. A lock with no deadline never expires on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked { until: Option<DateTime<Utc>> },
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub id: Uuid,
    pub identity_id: Uuid,
    pub access_token: String,
    pub refresh_token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_revoked: bool,
}

impl Session {
    pub fn new(
        identity_id: Uuid,
        access_token: String,
        refresh_token: String,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity_id,
            access_token,
            refresh_token,
            created_at,
            expires_at,
            is_revoked: false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// A retired refresh token, keyed by its SHA-256 digest.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RevokedTokenEntry {
    pub token_hash: String,
    pub revoked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FailedAttemptRecord {
    pub id: Uuid,
    pub username: String,
    pub source_address: String,
    pub attempted_at: DateTime<Utc>,
}

/// Column widths of `failed_login_attempts`; longer client input is cut.
const MAX_USERNAME_LENGTH: usize = 50;
const MAX_SOURCE_LENGTH: usize = 45;

impl FailedAttemptRecord {
    pub fn new(username: &str, source_address: &str, attempted_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.chars().take(MAX_USERNAME_LENGTH).collect(),
            source_address: source_address.chars().take(MAX_SOURCE_LENGTH).collect(),
            attempted_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OneTimeTokenKind {
    EmailVerification,
    PasswordReset,
}

impl OneTimeTokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OneTimeTokenKind::EmailVerification => "email_verification",
            OneTimeTokenKind::PasswordReset => "password_reset",
        }
    }
}

/// Single-use token for email verification or password reset. Only the
/// digest of the token is kept; the raw value goes to the user once.
#[derive(Debug, Clone)]
pub struct OneTimeToken {
    pub id: Uuid,
    pub identity_id: Uuid,
    pub token_hash: String,
    pub kind: OneTimeTokenKind,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_used: bool,
}

impl OneTimeToken {
    pub fn new(
        identity_id: Uuid,
        token_hash: String,
        kind: OneTimeTokenKind,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity_id,
            token_hash,
            kind,
            created_at,
            expires_at,
            is_used: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Consumed { identity_id: Uuid },
    Expired,
    NotFound,
}
