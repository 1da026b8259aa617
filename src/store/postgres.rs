use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use super::{StoreError, StoreResult, TokenStore, UserStore};
use crate::auth::generate_token;
use crate::models::token::TokenRecord;
use crate::models::user::{NewUser, Role, User, UserFilter, UserStatus, UserUpdate};

const TOKEN_COLUMNS: &str = "id, token, username, role, created_at, expired_at";
const USER_COLUMNS: &str =
    "id, username, password, fullname, email, role, status, created_at, updated_at";

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            if db.is_unique_violation() {
                return StoreError::Conflict(
                    db.constraint()
                        .map(|c| format!("unique constraint '{}' violated", c))
                        .unwrap_or_else(|| db.message().to_string()),
                );
            }
        }
        if matches!(e, sqlx::Error::PoolTimedOut) {
            return StoreError::Timeout;
        }
        StoreError::Unavailable(e)
    }
}

/// PostgreSQL-backed token and credential store.
///
/// Every statement runs under `op_timeout`; a call that exceeds it fails with
/// `StoreError::Timeout` instead of holding the request.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    op_timeout: Duration,
}

impl PgStore {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        op_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(op_timeout)
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool, op_timeout))
    }

    /// Wrap an already configured pool.
    pub fn from_pool(pool: PgPool, op_timeout: Duration) -> Self {
        Self { pool, op_timeout }
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn timed<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = Result<T, sqlx::Error>> + Send,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout),
        }
    }
}

// -- Token Operations --

#[async_trait]
impl TokenStore for PgStore {
    async fn upsert(
        &self,
        username: &str,
        role: Role,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<String> {
        let token = generate_token();
        self.timed(
            sqlx::query_scalar::<_, String>(
                r#"INSERT INTO tokens (token, username, role, expired_at)
                   VALUES ($1, $2, $3, $4)
                   ON CONFLICT (username) DO UPDATE
                   SET token = EXCLUDED.token,
                       role = EXCLUDED.role,
                       expired_at = EXCLUDED.expired_at,
                       created_at = NOW()
                   RETURNING token"#,
            )
            .bind(&token)
            .bind(username)
            .bind(role.as_str())
            .bind(expires_at)
            .fetch_one(&self.pool),
        )
        .await
    }

    async fn lookup(&self, token: &str) -> StoreResult<Option<TokenRecord>> {
        let row = self
            .timed(
                sqlx::query_as::<_, TokenRow>(&format!(
                    "SELECT {} FROM tokens WHERE token = $1",
                    TOKEN_COLUMNS
                ))
                .bind(token)
                .fetch_optional(&self.pool),
            )
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn find_by_username(&self, username: &str) -> StoreResult<Option<TokenRecord>> {
        let row = self
            .timed(
                sqlx::query_as::<_, TokenRow>(&format!(
                    "SELECT {} FROM tokens WHERE username = $1",
                    TOKEN_COLUMNS
                ))
                .bind(username)
                .fetch_optional(&self.pool),
            )
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn insert(
        &self,
        username: &str,
        token: &str,
        role: Role,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<TokenRecord> {
        let row = self
            .timed(
                sqlx::query_as::<_, TokenRow>(&format!(
                    r#"INSERT INTO tokens (token, username, role, expired_at)
                       VALUES ($1, $2, $3, $4)
                       RETURNING {}"#,
                    TOKEN_COLUMNS
                ))
                .bind(token)
                .bind(username)
                .bind(role.as_str())
                .bind(expires_at)
                .fetch_one(&self.pool),
            )
            .await?;
        row.try_into()
    }

    async fn rotate_expired(
        &self,
        username: &str,
        new_token: &str,
        role: Role,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<TokenRecord>> {
        // One statement: concurrent rotators serialize on the row lock and the
        // loser sees the fresh expiry, so its WHERE clause no longer matches.
        let row = self
            .timed(
                sqlx::query_as::<_, TokenRow>(&format!(
                    r#"UPDATE tokens
                       SET token = $1, role = $2, expired_at = $3, created_at = NOW()
                       WHERE username = $4 AND expired_at <= $5
                       RETURNING {}"#,
                    TOKEN_COLUMNS
                ))
                .bind(new_token)
                .bind(role.as_str())
                .bind(expires_at)
                .bind(username)
                .bind(now)
                .fetch_optional(&self.pool),
            )
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn delete(&self, token: &str) -> StoreResult<bool> {
        let result = self
            .timed(
                sqlx::query("DELETE FROM tokens WHERE token = $1")
                    .bind(token)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_username(&self, username: &str) -> StoreResult<bool> {
        let result = self
            .timed(
                sqlx::query("DELETE FROM tokens WHERE username = $1")
                    .bind(username)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_id(&self, id: i64) -> StoreResult<bool> {
        let result = self
            .timed(
                sqlx::query("DELETE FROM tokens WHERE id = $1")
                    .bind(id)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = self
            .timed(
                sqlx::query("DELETE FROM tokens WHERE expired_at <= $1")
                    .bind(now)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_all(&self) -> StoreResult<u64> {
        let result = self
            .timed(sqlx::query("DELETE FROM tokens").execute(&self.pool))
            .await?;
        Ok(result.rows_affected())
    }

    async fn count(&self) -> StoreResult<i64> {
        self.timed(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM tokens").fetch_one(&self.pool))
            .await
    }

    async fn list(&self) -> StoreResult<Vec<TokenRecord>> {
        let rows = self
            .timed(
                sqlx::query_as::<_, TokenRow>(&format!(
                    "SELECT {} FROM tokens ORDER BY created_at DESC",
                    TOKEN_COLUMNS
                ))
                .fetch_all(&self.pool),
            )
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn ping(&self) -> StoreResult<()> {
        self.timed(sqlx::query("SELECT 1").execute(&self.pool))
            .await
            .map(|_| ())
    }
}

// -- Credential Operations --

#[async_trait]
impl UserStore for PgStore {
    async fn create_user(&self, user: &NewUser) -> StoreResult<i64> {
        self.timed(
            sqlx::query_scalar::<_, i64>(
                r#"INSERT INTO users (username, password, fullname, email, role)
                   VALUES ($1, $2, $3, $4, $5)
                   RETURNING id"#,
            )
            .bind(&user.username)
            .bind(&user.password_hash)
            .bind(&user.fullname)
            .bind(&user.email)
            .bind(user.role.as_str())
            .fetch_one(&self.pool),
        )
        .await
    }

    async fn find_user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        let row = self
            .timed(
                sqlx::query_as::<_, UserRow>(&format!(
                    "SELECT {} FROM users WHERE username = $1",
                    USER_COLUMNS
                ))
                .bind(username)
                .fetch_optional(&self.pool),
            )
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn find_user_by_id(&self, id: i64) -> StoreResult<Option<User>> {
        let row = self
            .timed(
                sqlx::query_as::<_, UserRow>(&format!(
                    "SELECT {} FROM users WHERE id = $1",
                    USER_COLUMNS
                ))
                .bind(id)
                .fetch_optional(&self.pool),
            )
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn update_user(&self, update: &UserUpdate) -> StoreResult<bool> {
        let result = self
            .timed(
                sqlx::query(
                    r#"UPDATE users
                       SET password = COALESCE($1, password),
                           role = COALESCE($2, role),
                           email = COALESCE($3, email),
                           fullname = COALESCE($4, fullname),
                           status = COALESCE($5, status),
                           updated_at = NOW()
                       WHERE username = $6"#,
                )
                .bind(update.password.as_deref())
                .bind(update.role.map(|r| r.as_str()))
                .bind(update.email.as_deref())
                .bind(update.fullname.as_deref())
                .bind(update.status.map(|s| s.as_str()))
                .bind(&update.username)
                .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_user(&self, id: i64) -> StoreResult<bool> {
        let result = self
            .timed(
                sqlx::query("DELETE FROM users WHERE id = $1")
                    .bind(id)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_users(&self, filter: &UserFilter) -> StoreResult<Vec<User>> {
        let rows = self
            .timed(
                sqlx::query_as::<_, UserRow>(&format!(
                    r#"SELECT {} FROM users
                       WHERE ($1::TEXT IS NULL OR status = $1)
                         AND ($2::TEXT IS NULL OR role = $2)
                         AND ($3::TEXT IS NULL OR email = $3)
                         AND ($4::TEXT IS NULL OR fullname = $4)
                         AND ($5::TIMESTAMPTZ IS NULL OR created_at >= $5)
                         AND ($6::TIMESTAMPTZ IS NULL OR created_at < $6)
                         AND ($7::TIMESTAMPTZ IS NULL OR updated_at >= $7)
                         AND ($8::TIMESTAMPTZ IS NULL OR updated_at < $8)
                       ORDER BY id ASC"#,
                    USER_COLUMNS
                ))
                .bind(filter.status.map(|s| s.as_str()))
                .bind(filter.role.map(|r| r.as_str()))
                .bind(filter.email.as_deref())
                .bind(filter.fullname.as_deref())
                .bind(filter.created_after)
                .bind(filter.created_before)
                .bind(filter.updated_after)
                .bind(filter.updated_before)
                .fetch_all(&self.pool),
            )
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn count_users(&self) -> StoreResult<i64> {
        self.timed(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users").fetch_one(&self.pool))
            .await
    }
}

// -- Row structs --

#[derive(Debug, sqlx::FromRow)]
struct TokenRow {
    id: i64,
    token: String,
    username: String,
    role: String,
    created_at: DateTime<Utc>,
    expired_at: DateTime<Utc>,
}

impl TryFrom<TokenRow> for TokenRecord {
    type Error = StoreError;

    fn try_from(row: TokenRow) -> Result<Self, Self::Error> {
        Ok(TokenRecord {
            id: row.id,
            role: parse_column::<Role>("tokens.role", &row.role)?,
            token: row.token,
            username: row.username,
            created_at: row.created_at,
            expired_at: row.expired_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: i64,
    username: String,
    password: String,
    fullname: String,
    email: String,
    role: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(User {
            id: row.id,
            role: parse_column::<Role>("users.role", &row.role)?,
            status: parse_column::<UserStatus>("users.status", &row.status)?,
            username: row.username,
            password: row.password,
            email: row.email,
            fullname: row.fullname,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn parse_column<T: FromStr>(column: &str, value: &str) -> StoreResult<T> {
    value
        .parse()
        .map_err(|_| StoreError::InvalidRow(format!("{} has unexpected value '{}'", column, value)))
}
