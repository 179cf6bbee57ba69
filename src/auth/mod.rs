//! Authentication core.
//!
//! [`AuthCore`] is the only entry point the HTTP layer uses; the other
//! components are wired together inside it and exported for reuse and tests.

pub mod handlers;
pub mod lockout;
pub mod password;
pub mod rate_limit;
pub mod session;
pub mod token;

mod service;

pub use lockout::{AttemptOutcome, LoginAttemptTracker};
pub use password::{PasswordHasher, PasswordPolicy};
pub use rate_limit::{LocalBackend, RateLimitBackend, RateLimitSpec, RateLimiter, RedisBackend};
pub use service::{AuthCore, PurgeReport};
pub use session::{SessionRegistry, TokenRevocationRegistry};
pub use token::{Claims, TokenIssuer, TokenPair, TokenType};
