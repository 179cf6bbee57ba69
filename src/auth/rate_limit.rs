//! Fixed-window rate limiting with a shared Redis backend and an in-process
//! fallback.
//!
//! The backend is chosen once, when the limiter is built: if Redis answers a
//! `PING` within the connection timeout it becomes the primary, otherwise the
//! local backend does. A call that fails or times out against Redis later on
//! is counted locally instead of failing the request.
//!
//! The local backend is only visible to this process. While it is in use,
//! every instance of a multi-instance deployment enforces its own limit, so
//! the effective global limit is multiplied by the instance count. That is
//! accepted: rate limiting here is a protective layer, and staying available
//! wins over being exact during a cache outage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::Script;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::RateLimitSettings;
use crate::error::CacheError;

const KEY_PREFIX: &str = "rate_limit:";

// INCR and the first-hit PEXPIRE run as one script, so a racing caller can
// never push back the reset deadline of a window that is already open.
const INCREMENT_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return current
"#;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitSpecError {
    #[error("rate limit spec {0:?} is not of the form <count>/<period>")]
    Malformed(String),

    #[error("unknown rate limit period {0:?}")]
    UnknownPeriod(String),

    #[error("rate limit key is empty")]
    EmptyKey,
}

/// A parsed `"<count>/<period>"` limit such as `"5/minute"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSpec {
    pub limit: u64,
    pub period: Duration,
}

impl FromStr for RateLimitSpec {
    type Err = RateLimitSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || RateLimitSpecError::Malformed(s.to_string());
        let (count, period) = s.trim().split_once('/').ok_or_else(malformed)?;
        let limit: u64 = count.trim().parse().map_err(|_| malformed())?;
        let seconds = match period.trim().to_ascii_lowercase().as_str() {
            "second" | "seconds" => 1,
            "minute" | "minutes" => 60,
            "hour" | "hours" => 3600,
            "day" | "days" => 86400,
            other => return Err(RateLimitSpecError::UnknownPeriod(other.to_string())),
        };
        Ok(Self {
            limit,
            period: Duration::from_secs(seconds),
        })
    }
}

/// Atomic increment-and-get over a fixed window. Returns the count after
/// this call.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, CacheError>;

    fn name(&self) -> &'static str;
}

/// Shared counters in Redis; authoritative across instances.
#[derive(Clone)]
pub struct RedisBackend {
    connection: MultiplexedConnection,
    script: Arc<Script>,
}

impl RedisBackend {
    /// Opens a connection and checks it with `PING`, both bounded by `timeout`.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let mut connection = tokio::time::timeout(timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| CacheError::Timeout)??;

        let pong: String = tokio::time::timeout(timeout, redis::cmd("PING").query_async(&mut connection))
            .await
            .map_err(|_| CacheError::Timeout)??;
        debug!("Redis answered PING with {}", pong);

        Ok(Self {
            connection,
            script: Arc::new(Script::new(INCREMENT_SCRIPT)),
        })
    }
}

#[async_trait]
impl RateLimitBackend for RedisBackend {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, CacheError> {
        let mut connection = self.connection.clone();
        let count: u64 = self
            .script
            .key(format!("{KEY_PREFIX}{key}"))
            .arg(window.as_millis() as u64)
            .invoke_async(&mut connection)
            .await?;
        Ok(count)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[derive(Debug)]
struct Window {
    count: u64,
    reset_at: DateTime<Utc>,
}

/// Process-local counters. Non-authoritative: see the module docs.
pub struct LocalBackend {
    windows: Mutex<HashMap<String, Window>>,
    clock: Arc<dyn Clock>,
}

impl LocalBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Drops windows whose deadline has passed.
    pub async fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, window| now < window.reset_at);
        before - windows.len()
    }

    pub async fn len(&self) -> usize {
        self.windows.lock().await.len()
    }
}

#[async_trait]
impl RateLimitBackend for LocalBackend {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, CacheError> {
        let now = self.clock.now();
        let window_length = chrono::Duration::milliseconds(window.as_millis() as i64);
        let mut windows = self.windows.lock().await;

        let entry = windows.entry(format!("{KEY_PREFIX}{key}")).or_insert(Window {
            count: 0,
            reset_at: now,
        });
        // Expiry is evaluated lazily on every hit.
        if now >= entry.reset_at {
            entry.count = 0;
            entry.reset_at = now + window_length;
        }
        entry.count += 1;
        Ok(entry.count)
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

pub struct RateLimiter {
    primary: Arc<dyn RateLimitBackend>,
    fallback: Arc<LocalBackend>,
    call_timeout: Duration,
}

impl RateLimiter {
    /// Probes Redis once and keeps whichever backend wins for the limiter's
    /// whole lifetime.
    pub async fn connect(settings: &RateLimitSettings, clock: Arc<dyn Clock>) -> Self {
        let timeout = Duration::from_millis(settings.connection_timeout_ms);
        let fallback = Arc::new(LocalBackend::new(clock));

        match RedisBackend::connect(&settings.redis_url, timeout).await {
            Ok(redis) => {
                info!("Rate limiter using shared Redis backend");
                Self {
                    primary: Arc::new(redis),
                    fallback,
                    call_timeout: timeout,
                }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "Redis unreachable, rate limiting falls back to in-process counters; limits are per instance until restart"
                );
                Self {
                    primary: fallback.clone(),
                    fallback,
                    call_timeout: timeout,
                }
            }
        }
    }

    pub fn local(clock: Arc<dyn Clock>) -> Self {
        let fallback = Arc::new(LocalBackend::new(clock));
        Self {
            primary: fallback.clone(),
            fallback,
            call_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_backend(
        backend: Arc<dyn RateLimitBackend>,
        clock: Arc<dyn Clock>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            primary: backend,
            fallback: Arc::new(LocalBackend::new(clock)),
            call_timeout,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.primary.name()
    }

    /// Counts this call against `key` and reports whether it exceeds `spec`.
    ///
    /// A malformed key or spec never limits; the problem is logged instead.
    pub async fn is_limited(&self, key: &str, spec: &str) -> bool {
        match self.check(key, spec).await {
            Ok(limited) => limited,
            Err(e) => {
                warn!(target: "auth.rate_limit", key, spec, error = %e, "Ignoring unusable rate limit");
                false
            }
        }
    }

    pub async fn check(&self, key: &str, spec: &str) -> Result<bool, RateLimitSpecError> {
        if key.trim().is_empty() {
            return Err(RateLimitSpecError::EmptyKey);
        }
        let spec: RateLimitSpec = spec.parse()?;
        let count = self.increment(key, spec.period).await;
        let limited = count > spec.limit;
        if limited {
            info!(target: "auth.rate_limit", key, count, limit = spec.limit, "Rate limit exceeded");
        }
        Ok(limited)
    }

    pub async fn cleanup(&self) -> usize {
        self.fallback.cleanup().await
    }

    async fn increment(&self, key: &str, window: Duration) -> u64 {
        let attempt = tokio::time::timeout(self.call_timeout, self.primary.increment(key, window)).await;
        let error = match attempt {
            Ok(Ok(count)) => return count,
            Ok(Err(e)) => e,
            Err(_) => CacheError::Timeout,
        };
        warn!(
            backend = self.primary.name(),
            error = %error,
            "Rate limit backend failed, counting this call in-process"
        );
        // The local backend cannot fail.
        self.fallback.increment(key, window).await.unwrap_or(0)
    }
}
