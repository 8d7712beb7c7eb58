use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::{self, FromRow, PgPool};

use crate::auth::responses::Role;
use crate::store::{
    Identity, IdentityStore, LinkOutcome, NewIdentity, StoreError, StoreResult, UniqueKey,
};

const UNIQUE_VIOLATION: &str = "23505";
const EMAIL_CONSTRAINT: &str = "identities_email_key";
const EXTERNAL_SUBJECT_CONSTRAINT: &str = "identities_external_subject_id_key";

const IDENTITY_COLUMNS: &str = "id, full_name, email, password_hash, external_subject_id, role, active, created_at, updated_at";

#[derive(Debug, FromRow)]
struct IdentityRow {
    id: i64,
    full_name: String,
    email: String,
    password_hash: String,
    external_subject_id: Option<String>,
    role: String,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<IdentityRow> for Identity {
    type Error = StoreError;

    fn try_from(row: IdentityRow) -> Result<Self, Self::Error> {
        let role = Role::from_str(&row.role)
            .map_err(|_| StoreError::Corrupt(format!("unknown role '{}' on identity {}", row.role, row.id)))?;

        Ok(Identity {
            id: row.id,
            full_name: row.full_name,
            email: row.email,
            password_hash: row.password_hash,
            external_subject_id: row.external_subject_id,
            role,
            active: row.active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|code| code.to_string()).unwrap_or_default();
                if code == UNIQUE_VIOLATION {
                    return match db_err.constraint() {
                        Some(EMAIL_CONSTRAINT) => StoreError::Conflict(UniqueKey::Email),
                        Some(EXTERNAL_SUBJECT_CONSTRAINT) => {
                            StoreError::Conflict(UniqueKey::ExternalSubject)
                        }
                        _ => StoreError::Rejected(err.to_string()),
                    };
                }
                // Connection exceptions, operator intervention, insufficient resources.
                if code.starts_with("08") || code.starts_with("57") || code.starts_with("53") {
                    StoreError::Unavailable(err.to_string())
                } else {
                    StoreError::Rejected(err.to_string())
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. } => StoreError::Corrupt(err.to_string()),
            _ => StoreError::Rejected(err.to_string()),
        }
    }
}

/// Identity store backed by the `identities` table.
///
/// Every round-trip is bounded by `timeout`; an elapsed bound surfaces as
/// [`StoreError::Timeout`], which callers treat as transient.
#[derive(Debug, Clone)]
pub struct PgIdentityStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgIdentityStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    async fn bounded<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }

    async fn fetch_one_where(&self, predicate: &str, value: &str) -> StoreResult<Option<Identity>> {
        let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE {predicate} = $1");
        let row = self
            .bounded(
                sqlx::query_as::<_, IdentityRow>(&sql)
                    .bind(value)
                    .fetch_optional(&self.pool),
            )
            .await?;
        row.map(Identity::try_from).transpose()
    }
}

#[rocket::async_trait]
impl IdentityStore for PgIdentityStore {
    async fn find_by_id(&self, id: i64) -> StoreResult<Option<Identity>> {
        let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = $1");
        let row = self
            .bounded(
                sqlx::query_as::<_, IdentityRow>(&sql)
                    .bind(id)
                    .fetch_optional(&self.pool),
            )
            .await?;
        row.map(Identity::try_from).transpose()
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<Identity>> {
        self.fetch_one_where("email", email).await
    }

    async fn find_by_external_subject(&self, subject: &str) -> StoreResult<Option<Identity>> {
        self.fetch_one_where("external_subject_id", subject).await
    }

    async fn insert(&self, identity: NewIdentity) -> StoreResult<Identity> {
        let sql = format!(
            "INSERT INTO identities (full_name, email, password_hash, external_subject_id, role) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {IDENTITY_COLUMNS}"
        );
        let row = self
            .bounded(
                sqlx::query_as::<_, IdentityRow>(&sql)
                    .bind(&identity.full_name)
                    .bind(&identity.email)
                    .bind(&identity.password_hash)
                    .bind(identity.external_subject_id.as_deref())
                    .bind(identity.role.as_str())
                    .fetch_one(&self.pool),
            )
            .await?;
        Identity::try_from(row)
    }

    async fn link_external_subject(&self, id: i64, subject: &str) -> StoreResult<LinkOutcome> {
        let sql = format!(
            "UPDATE identities SET external_subject_id = $2, updated_at = now() \
             WHERE id = $1 AND external_subject_id IS NULL RETURNING {IDENTITY_COLUMNS}"
        );
        let linked = self
            .bounded(
                sqlx::query_as::<_, IdentityRow>(&sql)
                    .bind(id)
                    .bind(subject)
                    .fetch_optional(&self.pool),
            )
            .await?;

        if let Some(row) = linked {
            return Ok(LinkOutcome::Linked(Identity::try_from(row)?));
        }

        Ok(match self.find_by_id(id).await? {
            Some(current) => LinkOutcome::AlreadyLinked(current),
            None => LinkOutcome::Missing,
        })
    }

    async fn set_active(&self, id: i64, active: bool) -> StoreResult<Option<Identity>> {
        let sql = format!(
            "UPDATE identities SET active = $2, updated_at = now() WHERE id = $1 RETURNING {IDENTITY_COLUMNS}"
        );
        let row = self
            .bounded(
                sqlx::query_as::<_, IdentityRow>(&sql)
                    .bind(id)
                    .bind(active)
                    .fetch_optional(&self.pool),
            )
            .await?;
        row.map(Identity::try_from).transpose()
    }

    async fn ping(&self) -> StoreResult<()> {
        self.bounded(sqlx::query("SELECT 1").execute(&self.pool))
            .await
            .map(|_| ())
    }
}
