//! In-process user and refresh-token store.
//!
//! Backs the test suites and lets the server run without PostgreSQL.
//! A single `RwLock` per table keeps rotation atomic.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::AuthError;
use super::store::{RefreshTokenStore, UserStore, fingerprint};
use crate::models::auth::{NewUser, RefreshTokenRecord, User};
use crate::uuid::uuidv7;

#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<Uuid, User>>,
    /// Keyed by token fingerprint.
    tokens: RwLock<HashMap<String, RefreshTokenRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored users.
    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }

    /// All refresh-token records of a user, revoked or not.
    pub async fn tokens_for(&self, user_id: Uuid) -> Vec<RefreshTokenRecord> {
        self.tokens
            .read()
            .await
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect()
    }
}

fn new_record(user_id: Uuid, token: &str, expires_at: DateTime<Utc>) -> RefreshTokenRecord {
    RefreshTokenRecord {
        id: uuidv7(),
        user_id,
        token_hash: fingerprint(token),
        expires_at,
        revoked: false,
        created_at: Utc::now(),
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AuthError> {
        let users = self.users.read().await;
        Ok(users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, AuthError> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn create(&self, user: NewUser) -> Result<User, AuthError> {
        let mut users = self.users.write().await;
        if users
            .values()
            .any(|u| u.email.eq_ignore_ascii_case(&user.email))
        {
            return Err(AuthError::DuplicateEmail);
        }
        let now = Utc::now();
        let created = User {
            id: uuidv7(),
            email: user.email,
            password_hash: user.password_hash,
            name: user.name,
            avatar_url: user.avatar_url,
            provider: user.provider,
            provider_id: user.provider_id,
            created_at: now,
            updated_at: now,
        };
        users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn set_avatar(&self, id: Uuid, avatar_url: &str) -> Result<(), AuthError> {
        if let Some(user) = self.users.write().await.get_mut(&id) {
            user.avatar_url = Some(avatar_url.to_string());
            user.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryStore {
    async fn persist(
        &self,
        user_id: Uuid,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        let record = new_record(user_id, token, expires_at);
        let mut tokens = self.tokens.write().await;
        if tokens.contains_key(&record.token_hash) {
            return Err(AuthError::Internal("duplicate refresh token".into()));
        }
        tokens.insert(record.token_hash.clone(), record);
        Ok(())
    }

    async fn find_valid(&self, token: &str) -> Result<Option<RefreshTokenRecord>, AuthError> {
        let now = Utc::now();
        Ok(self
            .tokens
            .read()
            .await
            .get(&fingerprint(token))
            .filter(|r| r.is_valid_at(now))
            .cloned())
    }

    async fn revoke(&self, token: &str) -> Result<(), AuthError> {
        if let Some(record) = self.tokens.write().await.get_mut(&fingerprint(token)) {
            record.revoked = true;
        }
        Ok(())
    }

    async fn revoke_all(&self, user_id: Uuid) -> Result<u64, AuthError> {
        let mut changed = 0;
        for record in self.tokens.write().await.values_mut() {
            if record.user_id == user_id && !record.revoked {
                record.revoked = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn rotate(
        &self,
        presented: &str,
        user_id: Uuid,
        replacement: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, AuthError> {
        let now = Utc::now();
        let mut tokens = self.tokens.write().await;
        match tokens.get_mut(&fingerprint(presented)) {
            Some(record) if record.user_id == user_id && record.is_valid_at(now) => {
                record.revoked = true;
            }
            _ => return Ok(false),
        }
        let record = new_record(user_id, replacement, expires_at);
        tokens.insert(record.token_hash.clone(), record);
        Ok(true)
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64, AuthError> {
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, r| r.expires_at >= cutoff);
        Ok((before - tokens.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::auth::LOCAL_PROVIDER;
    use chrono::Duration;

    fn new_user(email: &str) -> NewUser {
        NewUser {
            email: email.to_string(),
            password_hash: Some("hash".into()),
            name: "Alice".into(),
            avatar_url: None,
            provider: LOCAL_PROVIDER.into(),
            provider_id: None,
        }
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected_case_insensitively() {
        let store = MemoryStore::new();
        store.create(new_user("a@x.com")).await.unwrap();

        let err = store.create(new_user("A@X.com")).await.unwrap_err();
        assert!(matches!(err, AuthError::DuplicateEmail));
        assert_eq!(store.user_count().await, 1);
    }

    #[tokio::test]
    async fn find_valid_hides_revoked_and_expired() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        let later = Utc::now() + Duration::days(1);

        store.persist(user_id, "live", later).await.unwrap();
        store.persist(user_id, "revoked", later).await.unwrap();
        store
            .persist(user_id, "expired", Utc::now() - Duration::seconds(1))
            .await
            .unwrap();
        store.revoke("revoked").await.unwrap();

        assert!(store.find_valid("live").await.unwrap().is_some());
        assert!(store.find_valid("revoked").await.unwrap().is_none());
        assert!(store.find_valid("expired").await.unwrap().is_none());
        assert!(store.find_valid("never-issued").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn revoke_is_idempotent() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        store
            .persist(user_id, "t", Utc::now() + Duration::days(1))
            .await
            .unwrap();

        store.revoke("t").await.unwrap();
        store.revoke("t").await.unwrap();
        store.revoke("unknown").await.unwrap();
        assert!(store.find_valid("t").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn revoke_all_only_touches_one_user() {
        let store = MemoryStore::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let later = Utc::now() + Duration::days(1);
        store.persist(alice, "a1", later).await.unwrap();
        store.persist(alice, "a2", later).await.unwrap();
        store.persist(bob, "b1", later).await.unwrap();

        assert_eq!(store.revoke_all(alice).await.unwrap(), 2);
        assert_eq!(store.revoke_all(alice).await.unwrap(), 0);
        assert!(store.find_valid("a1").await.unwrap().is_none());
        assert!(store.find_valid("b1").await.unwrap().is_some());
        // Records are kept for audit.
        assert_eq!(store.tokens_for(alice).await.len(), 2);
    }

    #[tokio::test]
    async fn rotate_consumes_once() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        let later = Utc::now() + Duration::days(1);
        store.persist(user_id, "old", later).await.unwrap();

        assert!(store.rotate("old", user_id, "new", later).await.unwrap());
        assert!(!store.rotate("old", user_id, "newer", later).await.unwrap());
        assert!(store.find_valid("old").await.unwrap().is_none());
        assert!(store.find_valid("new").await.unwrap().is_some());
        assert!(store.find_valid("newer").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rotate_rejects_foreign_owner() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let later = Utc::now() + Duration::days(1);
        store.persist(owner, "old", later).await.unwrap();

        assert!(!store.rotate("old", Uuid::new_v4(), "new", later).await.unwrap());
        assert!(store.find_valid("old").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn purge_removes_only_expired() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        store
            .persist(user_id, "old", Utc::now() - Duration::days(2))
            .await
            .unwrap();
        store
            .persist(user_id, "fresh", Utc::now() + Duration::days(2))
            .await
            .unwrap();

        assert_eq!(store.purge_expired(Utc::now()).await.unwrap(), 1);
        assert_eq!(store.tokens_for(user_id).await.len(), 1);
    }
}
