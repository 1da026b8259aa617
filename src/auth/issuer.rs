//! Token issuance, rotation and validation.
//!
//! The issuer holds no token state of its own: every call round-trips to the
//! `TokenStore`, which is the single source of truth and the serialization
//! point for concurrent logins.
//!
//! Policy:
//! - a live token (expiry strictly in the future) is returned unchanged;
//! - an expired token is rotated in place with a fresh `ttl` from now;
//! - there is no sliding expiration, a live token is never refreshed early.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;

use super::AuthError;
use crate::models::token::{Identity, TokenRecord};
use crate::models::user::Role;
use crate::store::{StoreError, TokenStore};

/// Random bytes per token.
pub const TOKEN_BYTES: usize = 32;

/// Length of the hex-rendered token; also the width of `tokens.token`.
pub const TOKEN_LEN: usize = TOKEN_BYTES * 2;

/// Rotation lifetime used when no other value is configured.
pub const DEFAULT_TOKEN_TTL: StdDuration = StdDuration::from_secs(15 * 60);

/// Read-then-write rounds before giving up on a contended username.
const MAX_ISSUE_ATTEMPTS: usize = 3;

/// 32 bytes from the OS CSPRNG, lowercase hex.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Clone)]
pub struct TokenIssuer {
    store: Arc<dyn TokenStore>,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(store: Arc<dyn TokenStore>, ttl: StdDuration) -> Self {
        let ttl = Duration::from_std(ttl).unwrap_or_else(|_| Duration::minutes(15));
        Self { store, ttl }
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    /// Expiry for a login happening now.
    pub fn expiry_from_now(&self) -> DateTime<Utc> {
        Utc::now() + self.ttl
    }

    /// Return the user's live token, or create / rotate one.
    ///
    /// `expires_at` applies only when no row exists yet; a rotation always
    /// uses `now + ttl`. Concurrent callers for the same username converge on
    /// one stored token: a lost insert (unique violation) or a lost rotation
    /// re-reads the row and returns the winner's token.
    pub async fn issue_or_refresh(
        &self,
        username: &str,
        role: Role,
        expires_at: DateTime<Utc>,
    ) -> Result<String, AuthError> {
        if expires_at <= Utc::now() {
            return Err(AuthError::Malformed("expiry must be in the future".into()));
        }

        for attempt in 1..=MAX_ISSUE_ATTEMPTS {
            let now = Utc::now();
            match self.store.find_by_username(username).await? {
                None => {
                    let token = generate_token();
                    match self.store.insert(username, &token, role, expires_at).await {
                        Ok(_) => {
                            tracing::info!(username = %username, role = %role, "issued new token");
                            return Ok(token);
                        }
                        Err(StoreError::Conflict(_)) => {
                            tracing::debug!(username = %username, attempt, "token insert lost race, re-reading");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Some(record) if record.is_live(now) => {
                    tracing::debug!(username = %username, "reusing live token");
                    return Ok(record.token);
                }
                Some(_) => {
                    let token = generate_token();
                    let fresh_expiry = now + self.ttl;
                    let rotated = self
                        .store
                        .rotate_expired(username, &token, role, fresh_expiry, now)
                        .await?;
                    if let Some(record) = rotated {
                        tracing::info!(username = %username, expires_at = %record.expired_at, "rotated expired token");
                        return Ok(record.token);
                    }
                    tracing::debug!(username = %username, attempt, "token rotation lost race, re-reading");
                }
            }
        }

        tracing::warn!(username = %username, "gave up issuing token after {} attempts", MAX_ISSUE_ATTEMPTS);
        Err(AuthError::Conflict(format!(
            "could not settle a token for '{}'",
            username
        )))
    }

    /// Resolve a bearer token to the identity it was issued for.
    pub async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let record = self.store.lookup(token).await?.ok_or(AuthError::NotFound)?;
        if !bool::from(record.token.as_bytes().ct_eq(token.as_bytes())) {
            return Err(AuthError::NotFound);
        }
        if !record.is_live(Utc::now()) {
            return Err(AuthError::Expired);
        }
        Ok(record.into())
    }

    /// Logout: drop one token.
    pub async fn revoke(&self, token: &str) -> Result<bool, AuthError> {
        Ok(self.store.delete(token).await?)
    }

    /// Drop whatever token the user holds. Takes effect on the next request.
    pub async fn revoke_user(&self, username: &str) -> Result<bool, AuthError> {
        let removed = self.store.delete_by_username(username).await?;
        if removed {
            tracing::info!(username = %username, "revoked token");
        }
        Ok(removed)
    }

    /// Drop a token by its row id, as shown by `usersys token list`.
    pub async fn revoke_id(&self, id: i64) -> Result<bool, AuthError> {
        let removed = self.store.delete_by_id(id).await?;
        if removed {
            tracing::info!(id, "revoked token");
        }
        Ok(removed)
    }

    pub async fn sweep_expired(&self) -> Result<u64, AuthError> {
        Ok(self.store.delete_expired(Utc::now()).await?)
    }

    pub async fn purge_all(&self) -> Result<u64, AuthError> {
        let removed = self.store.delete_all().await?;
        tracing::warn!(removed, "purged all tokens");
        Ok(removed)
    }

    pub async fn count(&self) -> Result<i64, AuthError> {
        Ok(self.store.count().await?)
    }

    pub async fn list(&self) -> Result<Vec<TokenRecord>, AuthError> {
        Ok(self.store.list().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::StoreResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn issuer_with_store() -> (TokenIssuer, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (TokenIssuer::new(store.clone(), DEFAULT_TOKEN_TTL), store)
    }

    fn in_15_min() -> DateTime<Utc> {
        Utc::now() + Duration::minutes(15)
    }

    fn is_hex_token(token: &str) -> bool {
        token.len() == TOKEN_LEN && token.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }

    #[test]
    fn test_generate_token_shape() {
        let a = generate_token();
        let b = generate_token();
        assert!(is_hex_token(&a), "bad token: {}", a);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_first_issue_creates_one_record() {
        let (issuer, store) = issuer_with_store();
        let token = issuer
            .issue_or_refresh("alice", Role::User, in_15_min())
            .await
            .unwrap();
        assert!(is_hex_token(&token));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_live_token_is_reused() {
        let (issuer, store) = issuer_with_store();
        let first = issuer
            .issue_or_refresh("alice", Role::User, in_15_min())
            .await
            .unwrap();
        let second = issuer
            .issue_or_refresh("alice", Role::User, in_15_min())
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_token_is_rotated() {
        let (issuer, store) = issuer_with_store();
        let stale = generate_token();
        store
            .insert("alice", &stale, Role::User, Utc::now() - Duration::seconds(1))
            .await
            .unwrap();

        let fresh = issuer
            .issue_or_refresh("alice", Role::User, in_15_min())
            .await
            .unwrap();
        assert_ne!(fresh, stale);
        assert!(matches!(issuer.validate(&stale).await, Err(AuthError::NotFound)));

        let record = store.find_by_username("alice").await.unwrap().unwrap();
        let remaining = record.expired_at - Utc::now();
        assert!(remaining > Duration::minutes(14) && remaining <= Duration::minutes(15));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_past_expiry_is_rejected_before_store() {
        let (issuer, store) = issuer_with_store();
        let err = issuer
            .issue_or_refresh("alice", Role::User, Utc::now() - Duration::seconds(5))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Malformed(_)));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_validate_returns_identity() {
        let (issuer, _) = issuer_with_store();
        let token = issuer
            .issue_or_refresh("root", Role::Admin, in_15_min())
            .await
            .unwrap();
        let identity = issuer.validate(&token).await.unwrap();
        assert_eq!(identity.username, "root");
        assert_eq!(identity.role, Role::Admin);
    }

    #[tokio::test]
    async fn test_validate_expired_and_unknown() {
        let (issuer, store) = issuer_with_store();
        let token = generate_token();
        store
            .insert("alice", &token, Role::User, Utc::now())
            .await
            .unwrap();
        assert!(matches!(issuer.validate(&token).await, Err(AuthError::Expired)));
        assert!(matches!(
            issuer.validate(&generate_token()).await,
            Err(AuthError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_revoke_user_invalidates_token() {
        let (issuer, _) = issuer_with_store();
        let token = issuer
            .issue_or_refresh("alice", Role::User, in_15_min())
            .await
            .unwrap();
        assert!(issuer.revoke_user("alice").await.unwrap());
        assert!(matches!(issuer.validate(&token).await, Err(AuthError::NotFound)));
        assert!(!issuer.revoke_user("alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_revoke_id_targets_one_row() {
        let (issuer, store) = issuer_with_store();
        let alice = issuer.issue_or_refresh("alice", Role::User, in_15_min()).await.unwrap();
        let bob = issuer.issue_or_refresh("bob", Role::User, in_15_min()).await.unwrap();
        let id = store.find_by_username("alice").await.unwrap().unwrap().id;

        assert!(issuer.revoke_id(id).await.unwrap());
        assert!(!issuer.revoke_id(id).await.unwrap());
        assert!(matches!(issuer.validate(&alice).await, Err(AuthError::NotFound)));
        assert!(issuer.validate(&bob).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_login_yields_one_record() {
        let (issuer, store) = issuer_with_store();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let issuer = issuer.clone();
                tokio::spawn(async move {
                    issuer
                        .issue_or_refresh("alice", Role::User, Utc::now() + Duration::minutes(15))
                        .await
                })
            })
            .collect();

        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(store.count().await.unwrap(), 1);
        for token in &tokens {
            let identity = issuer.validate(token).await.unwrap();
            assert_eq!(identity.username, "alice");
        }
        tokens.dedup();
        assert_eq!(tokens.len(), 1, "all callers converge on the stored token");
    }

    /// Reports "no row" on the first username read, as if another login
    /// inserted between our read and our write.
    struct StaleFirstRead {
        inner: MemoryStore,
        served_stale: AtomicBool,
    }

    #[async_trait]
    impl TokenStore for StaleFirstRead {
        async fn upsert(&self, username: &str, role: Role, exp: DateTime<Utc>) -> StoreResult<String> {
            self.inner.upsert(username, role, exp).await
        }
        async fn lookup(&self, token: &str) -> StoreResult<Option<TokenRecord>> {
            self.inner.lookup(token).await
        }
        async fn find_by_username(&self, username: &str) -> StoreResult<Option<TokenRecord>> {
            if !self.served_stale.swap(true, Ordering::SeqCst) {
                return Ok(None);
            }
            self.inner.find_by_username(username).await
        }
        async fn insert(&self, username: &str, token: &str, role: Role, exp: DateTime<Utc>) -> StoreResult<TokenRecord> {
            self.inner.insert(username, token, role, exp).await
        }
        async fn rotate_expired(
            &self,
            username: &str,
            new_token: &str,
            role: Role,
            exp: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> StoreResult<Option<TokenRecord>> {
            self.inner.rotate_expired(username, new_token, role, exp, now).await
        }
        async fn delete(&self, token: &str) -> StoreResult<bool> {
            self.inner.delete(token).await
        }
        async fn delete_by_username(&self, username: &str) -> StoreResult<bool> {
            self.inner.delete_by_username(username).await
        }
        async fn delete_by_id(&self, id: i64) -> StoreResult<bool> {
            self.inner.delete_by_id(id).await
        }
        async fn delete_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
            self.inner.delete_expired(now).await
        }
        async fn delete_all(&self) -> StoreResult<u64> {
            self.inner.delete_all().await
        }
        async fn count(&self) -> StoreResult<i64> {
            self.inner.count().await
        }
        async fn list(&self) -> StoreResult<Vec<TokenRecord>> {
            self.inner.list().await
        }
        async fn ping(&self) -> StoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_lost_insert_race_returns_winners_token() {
        let inner = MemoryStore::new();
        let winner = inner
            .insert("alice", &generate_token(), Role::User, in_15_min())
            .await
            .unwrap();
        let store = Arc::new(StaleFirstRead {
            inner: inner.clone(),
            served_stale: AtomicBool::new(false),
        });
        let issuer = TokenIssuer::new(store, DEFAULT_TOKEN_TTL);

        let token = issuer
            .issue_or_refresh("alice", Role::User, in_15_min())
            .await
            .unwrap();
        assert_eq!(token, winner.token);
        assert_eq!(inner.count().await.unwrap(), 1);
    }
}
