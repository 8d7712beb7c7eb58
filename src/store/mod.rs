//! Durable identity records and the contract every backing store honours.
//!
//! Uniqueness of `email` and of a non-null `external_subject_id` is enforced by
//! the store itself, never by callers: application code may pre-check, but a
//! [`StoreError::Conflict`] from [`IdentityStore::insert`] or
//! [`IdentityStore::link_external_subject`] is the authoritative answer.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::auth::responses::Role;

pub mod memory;
pub mod postgres;

pub use memory::MemoryIdentityStore;
pub use postgres::PgIdentityStore;

/// Stored in place of a password hash for identities created by external login.
/// It is not a PHC string, so it can never verify against any password.
pub const UNUSABLE_PASSWORD_HASH: &str = "!";

pub type StoreResult<T> = Result<T, StoreError>;

/// One user, keyed by unique (normalized) email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: i64,
    pub full_name: String,
    pub email: String,
    pub password_hash: String,
    pub external_subject_id: Option<String>,
    pub role: Role,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Identity {
    pub fn has_usable_password(&self) -> bool {
        self.password_hash != UNUSABLE_PASSWORD_HASH
    }
}

/// Insert payload; the store assigns `id`, `active = true` and timestamps.
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub full_name: String,
    pub email: String,
    pub password_hash: String,
    pub external_subject_id: Option<String>,
    pub role: Role,
}

/// Which unique key a conflicting write collided with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueKey {
    Email,
    ExternalSubject,
}

impl std::fmt::Display for UniqueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UniqueKey::Email => f.write_str("email"),
            UniqueKey::ExternalSubject => f.write_str("external subject"),
        }
    }
}

/// Result of an attempt to attach an external subject to an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// The subject slot was empty and now holds the requested subject.
    Linked(Identity),
    /// The slot was already filled; the row is returned as currently stored.
    AlreadyLinked(Identity),
    /// No identity with that id exists.
    Missing,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated on {0}")]
    Conflict(UniqueKey),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store rejected the operation: {0}")]
    Rejected(String),
    #[error("malformed identity row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

#[rocket::async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_by_id(&self, id: i64) -> StoreResult<Option<Identity>>;

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<Identity>>;

    async fn find_by_external_subject(&self, subject: &str) -> StoreResult<Option<Identity>>;

    /// Insert a new identity, failing with [`StoreError::Conflict`] when the email
    /// or external subject is already taken.
    async fn insert(&self, identity: NewIdentity) -> StoreResult<Identity>;

    /// Fill the external subject of identity `id` only if it is currently null.
    /// Never overwrites an existing link.
    async fn link_external_subject(&self, id: i64, subject: &str) -> StoreResult<LinkOutcome>;

    /// Returns the updated row, or `None` when no identity has that id.
    async fn set_active(&self, id: i64, active: bool) -> StoreResult<Option<Identity>>;

    /// Cheap round-trip used by readiness checks.
    async fn ping(&self) -> StoreResult<()>;
}
