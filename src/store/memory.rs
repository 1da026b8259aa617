//! In-process store with the same contract as `PgStore`.
//!
//! Backs the test suites and `usersys serve --memory` for local development.
//! All state sits behind one mutex, so every operation is atomic; it does not
//! survive a restart and is not shared between processes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;

use super::{StoreError, StoreResult, TokenStore, UserStore};
use crate::auth::generate_token;
use crate::models::token::TokenRecord;
use crate::models::user::{NewUser, Role, User, UserFilter, UserStatus, UserUpdate};

#[derive(Default)]
struct Tables {
    next_token_id: i64,
    /// Keyed by username; the token index is a scan with constant-time compare.
    tokens: HashMap<String, TokenRecord>,
    next_user_id: i64,
    users: BTreeMap<i64, User>,
}

impl Tables {
    fn token_taken(&self, token: &str) -> bool {
        self.tokens
            .values()
            .any(|r| bool::from(r.token.as_bytes().ct_eq(token.as_bytes())))
    }

    fn user_id_by_username(&self, username: &str) -> Option<i64> {
        self.users
            .values()
            .find(|u| u.username == username)
            .map(|u| u.id)
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn upsert(
        &self,
        username: &str,
        role: Role,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<String> {
        let mut tables = self.inner.lock().await;
        let token = generate_token();
        if tables.token_taken(&token) {
            return Err(StoreError::Conflict("token already exists".into()));
        }
        let now = Utc::now();
        if let Some(record) = tables.tokens.get_mut(username) {
            record.token = token.clone();
            record.role = role;
            record.expired_at = expires_at;
            record.created_at = now;
            return Ok(token);
        }
        tables.next_token_id += 1;
        let record = TokenRecord {
            id: tables.next_token_id,
            token: token.clone(),
            username: username.to_string(),
            role,
            created_at: now,
            expired_at: expires_at,
        };
        tables.tokens.insert(username.to_string(), record);
        Ok(token)
    }

    async fn lookup(&self, token: &str) -> StoreResult<Option<TokenRecord>> {
        let tables = self.inner.lock().await;
        Ok(tables
            .tokens
            .values()
            .find(|r| bool::from(r.token.as_bytes().ct_eq(token.as_bytes())))
            .cloned())
    }

    async fn find_by_username(&self, username: &str) -> StoreResult<Option<TokenRecord>> {
        Ok(self.inner.lock().await.tokens.get(username).cloned())
    }

    async fn insert(
        &self,
        username: &str,
        token: &str,
        role: Role,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<TokenRecord> {
        let mut tables = self.inner.lock().await;
        if tables.tokens.contains_key(username) {
            return Err(StoreError::Conflict(format!(
                "token for '{}' already exists",
                username
            )));
        }
        if tables.token_taken(token) {
            return Err(StoreError::Conflict("token already exists".into()));
        }
        tables.next_token_id += 1;
        let record = TokenRecord {
            id: tables.next_token_id,
            token: token.to_string(),
            username: username.to_string(),
            role,
            created_at: Utc::now(),
            expired_at: expires_at,
        };
        tables.tokens.insert(username.to_string(), record.clone());
        Ok(record)
    }

    async fn rotate_expired(
        &self,
        username: &str,
        new_token: &str,
        role: Role,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<TokenRecord>> {
        let mut tables = self.inner.lock().await;
        if tables.token_taken(new_token) {
            return Err(StoreError::Conflict("token already exists".into()));
        }
        match tables.tokens.get_mut(username) {
            Some(record) if record.expired_at <= now => {
                record.token = new_token.to_string();
                record.role = role;
                record.expired_at = expires_at;
                record.created_at = Utc::now();
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn delete(&self, token: &str) -> StoreResult<bool> {
        let mut tables = self.inner.lock().await;
        let before = tables.tokens.len();
        tables
            .tokens
            .retain(|_, r| !bool::from(r.token.as_bytes().ct_eq(token.as_bytes())));
        Ok(tables.tokens.len() < before)
    }

    async fn delete_by_username(&self, username: &str) -> StoreResult<bool> {
        Ok(self.inner.lock().await.tokens.remove(username).is_some())
    }

    async fn delete_by_id(&self, id: i64) -> StoreResult<bool> {
        let mut tables = self.inner.lock().await;
        let before = tables.tokens.len();
        tables.tokens.retain(|_, r| r.id != id);
        Ok(tables.tokens.len() < before)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut tables = self.inner.lock().await;
        let before = tables.tokens.len();
        tables.tokens.retain(|_, r| r.expired_at > now);
        Ok((before - tables.tokens.len()) as u64)
    }

    async fn delete_all(&self) -> StoreResult<u64> {
        let mut tables = self.inner.lock().await;
        let removed = tables.tokens.len() as u64;
        tables.tokens.clear();
        Ok(removed)
    }

    async fn count(&self) -> StoreResult<i64> {
        Ok(self.inner.lock().await.tokens.len() as i64)
    }

    async fn list(&self) -> StoreResult<Vec<TokenRecord>> {
        let tables = self.inner.lock().await;
        let mut records: Vec<TokenRecord> = tables.tokens.values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(records)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn create_user(&self, user: &NewUser) -> StoreResult<i64> {
        let mut tables = self.inner.lock().await;
        if tables.user_id_by_username(&user.username).is_some() {
            return Err(StoreError::Conflict(format!(
                "username '{}' already exists",
                user.username
            )));
        }
        tables.next_user_id += 1;
        let id = tables.next_user_id;
        let now = Utc::now();
        tables.users.insert(
            id,
            User {
                id,
                username: user.username.clone(),
                password: user.password_hash.clone(),
                role: user.role,
                email: user.email.clone(),
                fullname: user.fullname.clone(),
                status: UserStatus::Active,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn find_user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        let tables = self.inner.lock().await;
        Ok(tables
            .user_id_by_username(username)
            .and_then(|id| tables.users.get(&id).cloned()))
    }

    async fn find_user_by_id(&self, id: i64) -> StoreResult<Option<User>> {
        Ok(self.inner.lock().await.users.get(&id).cloned())
    }

    async fn update_user(&self, update: &UserUpdate) -> StoreResult<bool> {
        let mut tables = self.inner.lock().await;
        let Some(id) = tables.user_id_by_username(&update.username) else {
            return Ok(false);
        };
        let Some(user) = tables.users.get_mut(&id) else {
            return Ok(false);
        };
        if let Some(password) = &update.password {
            user.password = password.clone();
        }
        if let Some(role) = update.role {
            user.role = role;
        }
        if let Some(email) = &update.email {
            user.email = email.clone();
        }
        if let Some(fullname) = &update.fullname {
            user.fullname = fullname.clone();
        }
        if let Some(status) = update.status {
            user.status = status;
        }
        user.updated_at = Utc::now();
        Ok(true)
    }

    async fn remove_user(&self, id: i64) -> StoreResult<bool> {
        Ok(self.inner.lock().await.users.remove(&id).is_some())
    }

    async fn list_users(&self, filter: &UserFilter) -> StoreResult<Vec<User>> {
        let tables = self.inner.lock().await;
        Ok(tables
            .users
            .values()
            .filter(|u| filter.matches(u))
            .cloned()
            .collect())
    }

    async fn count_users(&self) -> StoreResult<i64> {
        Ok(self.inner.lock().await.users.len() as i64)
    }
}
