pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::token::TokenRecord;
use crate::models::user::{NewUser, Role, User, UserFilter, UserUpdate};

/// Failures a store can surface. "Not found" is never an error: lookups
/// return `Ok(None)` and deletes return `Ok(false)`.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique constraint rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The store call did not finish within the configured deadline.
    #[error("store call timed out")]
    Timeout,

    #[error("store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),

    /// A row held a value the model cannot represent.
    #[error("invalid row: {0}")]
    InvalidRow(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence for bearer tokens, keyed by username and by token value.
///
/// Implementations must enforce uniqueness of both keys and make `upsert`
/// and `rotate_expired` single atomic operations.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Insert a fresh token for `username`, or rotate the existing row in place.
    /// Returns the token now stored for the user.
    async fn upsert(
        &self,
        username: &str,
        role: Role,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<String>;

    /// Exact-match lookup by token value.
    async fn lookup(&self, token: &str) -> StoreResult<Option<TokenRecord>>;

    async fn find_by_username(&self, username: &str) -> StoreResult<Option<TokenRecord>>;

    /// Plain insert. A second row for the same username fails with `Conflict`.
    async fn insert(
        &self,
        username: &str,
        token: &str,
        role: Role,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<TokenRecord>;

    /// Replace the token of `username` only if its row has expired as of `now`.
    /// Returns `None` when the row is live again or gone.
    async fn rotate_expired(
        &self,
        username: &str,
        new_token: &str,
        role: Role,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<TokenRecord>>;

    async fn delete(&self, token: &str) -> StoreResult<bool>;

    async fn delete_by_username(&self, username: &str) -> StoreResult<bool>;

    async fn delete_by_id(&self, id: i64) -> StoreResult<bool>;

    /// Remove every row whose `expired_at` is at or before `now`.
    async fn delete_expired(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    async fn delete_all(&self) -> StoreResult<u64>;

    async fn count(&self) -> StoreResult<i64>;

    /// All rows, newest first.
    async fn list(&self) -> StoreResult<Vec<TokenRecord>>;

    /// Cheap round trip used by the readiness probe.
    async fn ping(&self) -> StoreResult<()>;
}

/// Persistence for accounts.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Returns the new user's id. A duplicate username fails with `Conflict`.
    async fn create_user(&self, user: &NewUser) -> StoreResult<i64>;

    async fn find_user_by_username(&self, username: &str) -> StoreResult<Option<User>>;

    async fn find_user_by_id(&self, id: i64) -> StoreResult<Option<User>>;

    /// Apply the present fields of `update`. The password, if present, must
    /// already be hashed. Returns false when no user matched.
    async fn update_user(&self, update: &UserUpdate) -> StoreResult<bool>;

    /// Hard delete.
    async fn remove_user(&self, id: i64) -> StoreResult<bool>;

    async fn list_users(&self, filter: &UserFilter) -> StoreResult<Vec<User>>;

    async fn count_users(&self) -> StoreResult<i64>;
}
