//! Persistence seams for users and refresh tokens.
//!
//! Two implementations exist: [`PgStore`](super::queries::PgStore) for
//! production and [`MemoryStore`](super::memory::MemoryStore) for tests and
//! database-less development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::AuthError;
use crate::models::auth::{NewUser, RefreshTokenRecord, User};

/// User lookups and creation.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Find a user by (already normalized) email.
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AuthError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, AuthError>;

    /// Insert a user. Fails with [`AuthError::DuplicateEmail`] if the email is taken.
    async fn create(&self, user: NewUser) -> Result<User, AuthError>;

    /// Set the avatar URL and bump `updated_at`.
    async fn set_avatar(&self, id: Uuid, avatar_url: &str) -> Result<(), AuthError>;
}

/// Registry of issued refresh tokens.
///
/// Every method takes the plaintext token and stores or matches only its
/// [`fingerprint`].
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    /// Insert a new, non-revoked record.
    async fn persist(
        &self,
        user_id: Uuid,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), AuthError>;

    /// Return the record only if it exists, is not revoked and has not expired.
    async fn find_valid(&self, token: &str) -> Result<Option<RefreshTokenRecord>, AuthError>;

    /// Mark one token revoked. Idempotent.
    async fn revoke(&self, token: &str) -> Result<(), AuthError>;

    /// Mark every token of a user revoked. Idempotent; returns how many changed.
    async fn revoke_all(&self, user_id: Uuid) -> Result<u64, AuthError>;

    /// Atomically consume `presented` and persist `replacement`.
    ///
    /// Returns `false`, and persists nothing, when `presented` is not a valid
    /// token of `user_id`. Of two concurrent calls with the same presented
    /// token at most one returns `true`.
    async fn rotate(
        &self,
        presented: &str,
        user_id: Uuid,
        replacement: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, AuthError>;

    /// Delete records that expired before `cutoff`. Returns how many were removed.
    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64, AuthError>;
}

/// SHA-256 hex fingerprint of a refresh token, used as its storage key.
pub fn fingerprint(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}
