//! In-process identity store.
//!
//! All writes take one lock, so insert and link are atomic with respect to the
//! uniqueness checks, giving the same guarantees as the Postgres constraints.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;

use crate::auth::responses::Role;

use crate::store::{
    Identity, IdentityStore, LinkOutcome, NewIdentity, StoreError, StoreResult, UniqueKey,
};

#[derive(Default)]
struct Tables {
    next_id: i64,
    rows: HashMap<i64, Identity>,
    by_email: HashMap<String, i64>,
    by_subject: HashMap<String, i64>,
}

#[derive(Default)]
pub struct MemoryIdentityStore {
    tables: Mutex<Tables>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored identities whose email equals `email`.
    pub fn count_by_email(&self, email: &str) -> usize {
        let tables = self.tables.lock();
        tables.rows.values().filter(|row| row.email == email).count()
    }

    pub fn len(&self) -> usize {
        self.tables.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Change a stored role in place, as an operator editing the row would.
    pub fn set_role(&self, id: i64, role: Role) -> bool {
        let mut tables = self.tables.lock();
        match tables.rows.get_mut(&id) {
            Some(row) => {
                row.role = role;
                row.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }
}

#[rocket::async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn find_by_id(&self, id: i64) -> StoreResult<Option<Identity>> {
        Ok(self.tables.lock().rows.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<Identity>> {
        let tables = self.tables.lock();
        Ok(tables
            .by_email
            .get(email)
            .and_then(|id| tables.rows.get(id))
            .cloned())
    }

    async fn find_by_external_subject(&self, subject: &str) -> StoreResult<Option<Identity>> {
        let tables = self.tables.lock();
        Ok(tables
            .by_subject
            .get(subject)
            .and_then(|id| tables.rows.get(id))
            .cloned())
    }

    async fn insert(&self, identity: NewIdentity) -> StoreResult<Identity> {
        let mut tables = self.tables.lock();

        if tables.by_email.contains_key(&identity.email) {
            return Err(StoreError::Conflict(UniqueKey::Email));
        }
        if let Some(subject) = &identity.external_subject_id {
            if tables.by_subject.contains_key(subject) {
                return Err(StoreError::Conflict(UniqueKey::ExternalSubject));
            }
        }

        tables.next_id += 1;
        let now = Utc::now();
        let row = Identity {
            id: tables.next_id,
            full_name: identity.full_name,
            email: identity.email,
            password_hash: identity.password_hash,
            external_subject_id: identity.external_subject_id,
            role: identity.role,
            active: true,
            created_at: now,
            updated_at: now,
        };

        tables.by_email.insert(row.email.clone(), row.id);
        if let Some(subject) = &row.external_subject_id {
            tables.by_subject.insert(subject.clone(), row.id);
        }
        tables.rows.insert(row.id, row.clone());

        Ok(row)
    }

    async fn link_external_subject(&self, id: i64, subject: &str) -> StoreResult<LinkOutcome> {
        let mut tables = self.tables.lock();

        let current = match tables.rows.get(&id) {
            Some(row) => row.clone(),
            None => return Ok(LinkOutcome::Missing),
        };
        if current.external_subject_id.is_some() {
            return Ok(LinkOutcome::AlreadyLinked(current));
        }
        if tables.by_subject.contains_key(subject) {
            return Err(StoreError::Conflict(UniqueKey::ExternalSubject));
        }

        tables.by_subject.insert(subject.to_string(), id);
        let row = tables
            .rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::Corrupt(format!("identity {id} vanished during link")))?;
        row.external_subject_id = Some(subject.to_string());
        row.updated_at = Utc::now();

        Ok(LinkOutcome::Linked(row.clone()))
    }

    async fn set_active(&self, id: i64, active: bool) -> StoreResult<Option<Identity>> {
        let mut tables = self.tables.lock();
        Ok(tables.rows.get_mut(&id).map(|row| {
            row.active = active;
            row.updated_at = Utc::now();
            row.clone()
        }))
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
