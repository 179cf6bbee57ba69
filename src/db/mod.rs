//! Persistence boundary for the auth core.
//!
//! `AuthStore` is the contract; `DbOperations` implements it on Postgres and
//! `MemoryStore` keeps everything in process for tests and single-node use.

pub mod memory;
pub mod models;
pub mod operations;
pub mod store;

pub use memory::MemoryStore;
pub use models::{
    ConsumeOutcome, FailedAttemptRecord, Identity, IdentityView, LockState, OneTimeToken,
    OneTimeTokenKind, RevokedTokenEntry, Role, Session,
};
pub use operations::DbOperations;
pub use store::AuthStore;
