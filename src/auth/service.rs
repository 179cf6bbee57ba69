use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::lockout::{AttemptOutcome, LoginAttemptTracker};
use crate::auth::password::{validate_email, validate_username, PasswordHasher, PasswordPolicy};
use crate::auth::rate_limit::RateLimiter;
use crate::auth::session::{SessionRegistry, TokenRevocationRegistry};
use crate::auth::token::{digest_token, generate_one_time_token, TokenIssuer, TokenPair, TokenType};
use crate::clock::Clock;
use crate::config::{RateLimitSettings, Settings};
use crate::db::{
    AuthStore, ConsumeOutcome, Identity, IdentityView, OneTimeToken, OneTimeTokenKind, Role,
};
use crate::error::{AppError, AuthError, DatabaseError};
use crate::notify::{Notifications, Notifier};

/// Verified against when the username is unknown, so both paths cost one
/// Argon2 verification.
const TIMING_DUMMY_PASSWORD: &str = "timing-equalisation-only";

/// Counts removed by one [`AuthCore::purge_expired`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    pub revoked_tokens: u64,
    pub failed_attempts: u64,
    pub rate_limit_windows: usize,
}

/// The authentication core: every auth operation exposed to the API layer.
pub struct AuthCore {
    store: Arc<dyn AuthStore>,
    hasher: PasswordHasher,
    policy: PasswordPolicy,
    issuer: Arc<TokenIssuer>,
    sessions: SessionRegistry,
    revocations: Arc<TokenRevocationRegistry>,
    attempts: LoginAttemptTracker,
    rate_limiter: Arc<RateLimiter>,
    rate_limits: RateLimitSettings,
    notifications: Notifications,
    clock: Arc<dyn Clock>,
    require_verified_email: bool,
    verification_ttl: Duration,
    reset_ttl: Duration,
    dummy_hash: String,
}

impl AuthCore {
    pub fn new(
        settings: &Settings,
        store: Arc<dyn AuthStore>,
        rate_limiter: Arc<RateLimiter>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AppError> {
        let hasher = PasswordHasher::new(&settings.password);
        let dummy_hash = hasher.hash(TIMING_DUMMY_PASSWORD)?;
        let notifications = Notifications::new(notifier);

        let issuer = Arc::new(TokenIssuer::new(&settings.auth, clock.clone()));
        let revocations = Arc::new(TokenRevocationRegistry::new(store.clone(), clock.clone()));
        let sessions = SessionRegistry::new(
            store.clone(),
            issuer.clone(),
            revocations.clone(),
            clock.clone(),
        );
        let attempts = LoginAttemptTracker::new(
            &settings.lockout,
            store.clone(),
            clock.clone(),
            notifications.clone(),
        );

        Ok(Self {
            store,
            hasher,
            policy: PasswordPolicy::new(&settings.password),
            issuer,
            sessions,
            revocations,
            attempts,
            rate_limiter,
            rate_limits: settings.rate_limit.clone(),
            notifications,
            clock,
            require_verified_email: settings.auth.require_verified_email,
            verification_ttl: Duration::hours(settings.auth.email_verification_expiry_hours),
            reset_ttl: Duration::minutes(settings.auth.password_reset_expiry_minutes),
            dummy_hash,
        })
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Creates an unverified identity and sends it a verification token.
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
        source: &str,
    ) -> Result<IdentityView, AppError> {
        self.enforce_rate_limit("register", source, &self.rate_limits.register)
            .await?;

        let email = normalize_email(email);
        validate_username(username)?;
        validate_email(&email)?;
        self.policy.check(password)?;

        let password_hash = self.hash_password(password).await?;
        let identity = Identity::new(username.to_string(), email, password_hash, self.clock.now());

        match self.store.insert_identity(&identity).await {
            Ok(()) => {}
            Err(DatabaseError::Duplicate) => return Err(AuthError::IdentityExists.into()),
            Err(e) => return Err(e.into()),
        }

        let token = self
            .issue_one_time_token(identity.id, OneTimeTokenKind::EmailVerification)
            .await?;
        self.notifications.verification(identity.email.clone(), token);

        info!(target: "auth.register", identity_id = %identity.id, source, "Identity registered");
        Ok(identity.view())
    }

    /// Checks credentials and opens a session.
    ///
    /// Order matters: the rate limit is applied before any lookup, a locked
    /// identity is rejected without counting an attempt, and the failure
    /// that reaches the lockout threshold already reports the lock.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        source: &str,
    ) -> Result<TokenPair, AppError> {
        self.enforce_rate_limit("login", source, &self.rate_limits.login)
            .await?;

        let identity = self.store.find_identity_by_username(username).await?;
        if let Some(identity) = &identity {
            if let Err(e) = self.attempts.ensure_unlocked(identity).await {
                warn!(target: "auth.login", identity_id = %identity.id, source, "Login on locked identity");
                return Err(e);
            }
        }

        let valid = match &identity {
            Some(identity) => self.verify_password(password, &identity.password_hash).await?,
            None => {
                self.verify_password(password, &self.dummy_hash).await?;
                false
            }
        };

        let identity = match identity {
            Some(identity) if valid => identity,
            identity => {
                let outcome = self
                    .attempts
                    .record_failure(username, identity.as_ref(), source)
                    .await?;
                return Err(match outcome {
                    AttemptOutcome::Locked { until } => AuthError::AccountLocked {
                        locked_until: Some(until),
                    },
                    AttemptOutcome::Recorded { .. } => AuthError::InvalidCredentials,
                }
                .into());
            }
        };

        if self.require_verified_email && !identity.is_verified {
            return Err(AuthError::EmailNotVerified.into());
        }

        if self.hasher.needs_rehash(&identity.password_hash) {
            self.upgrade_hash(&identity, password).await;
        }

        let pair = self.sessions.open(identity.id).await?;
        self.store.record_login(identity.id, self.clock.now()).await?;

        info!(target: "auth.login", identity_id = %identity.id, source, "Login succeeded");
        Ok(pair)
    }

    /// Exchanges a refresh token for a new pair. The presented token can
    /// never be used again after this call, whatever its outcome.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AppError> {
        let subject = self.issuer.verify(refresh_token, TokenType::Refresh)?;

        if self.revocations.is_revoked(refresh_token).await? {
            warn!(target: "auth.token.reuse", subject = %subject, "Revoked refresh token presented");
            return Err(AuthError::TokenRevoked.into());
        }

        let identity = self.identity_for_subject(&subject).await?;
        self.attempts.ensure_unlocked(&identity).await?;

        self.sessions.rotate(refresh_token).await
    }

    /// Ends every session of the token's owner.
    pub async fn logout(&self, access_token: &str) -> Result<usize, AppError> {
        let subject = self.issuer.verify(access_token, TokenType::Access)?;
        let identity_id = parse_subject(&subject)?;

        let revoked = self.sessions.revoke_all_for_identity(identity_id).await?;
        info!(target: "auth.logout", identity_id = %identity_id, sessions = revoked, "Logged out");
        Ok(revoked)
    }

    /// Resolves an access token to its identity. The token must still belong
    /// to a live session.
    pub async fn authenticate(&self, access_token: &str) -> Result<IdentityView, AppError> {
        let subject = self.issuer.verify(access_token, TokenType::Access)?;
        let session = self
            .sessions
            .find_by_access(access_token)
            .await?
            .ok_or(AuthError::SessionNotFound)?;

        let identity = self.identity_for_subject(&subject).await?;
        if identity.id != session.identity_id {
            return Err(AuthError::TokenInvalid.into());
        }
        Ok(identity.view())
    }

    /// Like [`AuthCore::authenticate`], and additionally requires `role`.
    pub async fn authorize(&self, access_token: &str, role: Role) -> Result<IdentityView, AppError> {
        let identity = self.authenticate(access_token).await?;
        if !identity.roles.contains(&role) {
            warn!(
                target: "auth.authorize",
                identity_id = %identity.id,
                role = %role,
                "Missing role"
            );
            return Err(AuthError::MissingRole(role).into());
        }
        Ok(identity)
    }

    pub async fn grant_role(&self, identity_id: Uuid, role: Role) -> Result<IdentityView, AppError> {
        self.store.assign_role(identity_id, role).await?;
        let identity = self
            .store
            .find_identity_by_id(identity_id)
            .await?
            .ok_or(DatabaseError::NotFound)?;

        info!(target: "auth.roles", identity_id = %identity_id, role = %role, "Role granted");
        Ok(identity.view())
    }

    /// Always succeeds for a well-formed request, so the response does not
    /// reveal whether the email is registered.
    pub async fn request_password_reset(&self, email: &str, source: &str) -> Result<(), AppError> {
        self.enforce_rate_limit("password_reset", source, &self.rate_limits.password_reset)
            .await?;

        let email = normalize_email(email);
        let Some(identity) = self.store.find_identity_by_email(&email).await? else {
            debug!(target: "auth.password_reset", source, "Reset requested for unknown email");
            return Ok(());
        };

        let token = self
            .issue_one_time_token(identity.id, OneTimeTokenKind::PasswordReset)
            .await?;
        self.notifications.password_reset(identity.email.clone(), token);

        info!(target: "auth.password_reset", identity_id = %identity.id, source, "Password reset requested");
        Ok(())
    }

    /// Sets a new password and revokes every session of the identity.
    pub async fn confirm_password_reset(&self, token: &str, new_password: &str) -> Result<(), AppError> {
        // Checked first so a rejected password does not burn the token.
        self.policy.check(new_password)?;

        let identity_id = self
            .consume_one_time_token(token, OneTimeTokenKind::PasswordReset)
            .await?;
        let password_hash = self.hash_password(new_password).await?;
        self.store.update_password_hash(identity_id, &password_hash).await?;

        let revoked = self.sessions.revoke_all_for_identity(identity_id).await?;
        info!(
            target: "auth.password_reset",
            identity_id = %identity_id,
            sessions = revoked,
            "Password reset completed"
        );
        Ok(())
    }

    pub async fn verify_email(&self, token: &str) -> Result<(), AppError> {
        let identity_id = self
            .consume_one_time_token(token, OneTimeTokenKind::EmailVerification)
            .await?;
        self.store.mark_verified(identity_id).await?;

        info!(target: "auth.email.verify", identity_id = %identity_id, "Email verified");
        Ok(())
    }

    /// Replaces any outstanding verification token. Silent for unknown or
    /// already verified addresses.
    pub async fn resend_verification(&self, email: &str, source: &str) -> Result<(), AppError> {
        self.enforce_rate_limit(
            "resend_verification",
            source,
            &self.rate_limits.resend_verification,
        )
        .await?;

        let email = normalize_email(email);
        let identity = match self.store.find_identity_by_email(&email).await? {
            Some(identity) if !identity.is_verified => identity,
            _ => return Ok(()),
        };

        let token = self
            .issue_one_time_token(identity.id, OneTimeTokenKind::EmailVerification)
            .await?;
        self.notifications.verification(identity.email.clone(), token);

        info!(target: "auth.email.verify", identity_id = %identity.id, "Verification email resent");
        Ok(())
    }

    /// Drops revocation entries past their token's expiry, failed attempts
    /// older than the lockout window and stale rate-limit windows.
    pub async fn purge_expired(&self) -> Result<PurgeReport, AppError> {
        let revoked_tokens = self.revocations.purge_expired().await?;
        let failed_attempts = self
            .store
            .purge_failed_attempts(self.clock.now() - self.attempts.window())
            .await?;
        let rate_limit_windows = self.rate_limiter.cleanup().await;

        Ok(PurgeReport {
            revoked_tokens,
            failed_attempts,
            rate_limit_windows,
        })
    }

    async fn enforce_rate_limit(&self, action: &str, source: &str, spec: &str) -> Result<(), AppError> {
        let key = format!("{}:{}", action, source);
        if self.rate_limiter.is_limited(&key, spec).await {
            warn!(target: "auth.rate_limit", action, source, "Request rate limited");
            return Err(AuthError::RateLimited.into());
        }
        Ok(())
    }

    async fn identity_for_subject(&self, subject: &str) -> Result<Identity, AppError> {
        let id = parse_subject(subject)?;
        self.store
            .find_identity_by_id(id)
            .await?
            .ok_or_else(|| AuthError::TokenInvalid.into())
    }

    /// Only one token of each kind is outstanding per identity; older unused
    /// ones are dropped.
    async fn issue_one_time_token(
        &self,
        identity_id: Uuid,
        kind: OneTimeTokenKind,
    ) -> Result<String, AppError> {
        let ttl = match kind {
            OneTimeTokenKind::EmailVerification => self.verification_ttl,
            OneTimeTokenKind::PasswordReset => self.reset_ttl,
        };
        self.store.delete_unused_one_time_tokens(identity_id, kind).await?;

        let raw = generate_one_time_token();
        let now = self.clock.now();
        let token = OneTimeToken::new(identity_id, digest_token(&raw), kind, now, now + ttl);
        self.store.insert_one_time_token(&token).await?;
        Ok(raw)
    }

    async fn consume_one_time_token(&self, token: &str, kind: OneTimeTokenKind) -> Result<Uuid, AppError> {
        let outcome = self
            .store
            .consume_one_time_token(&digest_token(token), kind, self.clock.now())
            .await?;
        match outcome {
            ConsumeOutcome::Consumed { identity_id } => Ok(identity_id),
            ConsumeOutcome::Expired => Err(AuthError::TokenExpired.into()),
            ConsumeOutcome::NotFound => Err(AuthError::TokenInvalid.into()),
        }
    }

    async fn upgrade_hash(&self, identity: &Identity, password: &str) {
        let result = match self.hash_password(password).await {
            Ok(hash) => self
                .store
                .update_password_hash(identity.id, &hash)
                .await
                .map_err(AppError::from),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!(identity_id = %identity.id, "Password hash upgraded"),
            Err(e) => warn!(identity_id = %identity.id, error = %e, "Password hash upgrade failed"),
        }
    }

    async fn hash_password(&self, password: &str) -> Result<String, AppError> {
        let hasher = self.hasher.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| AppError::InternalError(format!("Hashing task failed: {}", e)))?
    }

    async fn verify_password(&self, password: &str, hash: &str) -> Result<bool, AppError> {
        let hasher = self.hasher.clone();
        let password = password.to_string();
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .map_err(|e| AppError::InternalError(format!("Verification task failed: {}", e)))
    }
}

fn parse_subject(subject: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(subject).map_err(|_| AuthError::TokenInvalid.into())
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
