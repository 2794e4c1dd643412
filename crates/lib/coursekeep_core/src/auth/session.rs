//! Session service: register, login, refresh and logout.
//!
//! Refresh tokens are single use: every refresh consumes the presented token
//! through [`RefreshTokenStore::rotate`]. Access tokens are never looked up
//! here; see [`Authenticator`](super::jwt::Authenticator) for that fast path.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use super::AuthError;
use super::jwt::TokenCodec;
use super::password::{MAX_PASSWORD_BYTES, PasswordHasher};
use super::store::{RefreshTokenStore, UserStore};
use crate::models::auth::{LOCAL_PROVIDER, NewUser, Session, TokenKind, User};

/// Minimum accepted password length at registration.
pub const MIN_PASSWORD_LEN: usize = 6;

/// Trim and lower-case an email for lookup and storage.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn validate_registration(email: &str, password: &str, name: &str) -> Result<(), AuthError> {
    let well_formed = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if !well_formed || email.chars().any(char::is_whitespace) {
        return Err(AuthError::Validation("A valid email is required".into()));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    if password.len() > MAX_PASSWORD_BYTES {
        return Err(AuthError::Validation(format!(
            "Password must be at most {MAX_PASSWORD_BYTES} bytes"
        )));
    }
    if name.is_empty() {
        return Err(AuthError::Validation("Name is required".into()));
    }
    Ok(())
}

/// Orchestrates the session lifecycle over the stores and the token codec.
pub struct AuthSessionService {
    users: Arc<dyn UserStore>,
    tokens: Arc<dyn RefreshTokenStore>,
    codec: TokenCodec,
    hasher: PasswordHasher,
}

impl AuthSessionService {
    pub fn new(
        users: Arc<dyn UserStore>,
        tokens: Arc<dyn RefreshTokenStore>,
        codec: TokenCodec,
        hasher: PasswordHasher,
    ) -> Self {
        Self {
            users,
            tokens,
            codec,
            hasher,
        }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn users(&self) -> &Arc<dyn UserStore> {
        &self.users
    }

    /// Create a `local` account and sign it in.
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        name: &str,
    ) -> Result<Session, AuthError> {
        let email = normalize_email(email);
        let name = name.trim();
        validate_registration(&email, password, name)?;

        if self.users.find_by_email(&email).await?.is_some() {
            return Err(AuthError::DuplicateEmail);
        }

        let password_hash = self.hash_password(password).await?;
        // The store re-checks uniqueness, so a concurrent registration of the
        // same email still ends in DuplicateEmail.
        let user = self
            .users
            .create(NewUser {
                email,
                password_hash: Some(password_hash),
                name: name.to_string(),
                avatar_url: None,
                provider: LOCAL_PROVIDER.to_string(),
                provider_id: None,
            })
            .await?;

        info!(user_id = %user.id, "registered local user");
        self.issue_session(&user).await
    }

    /// Authenticate with email + password.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let email = normalize_email(email);

        // Unknown email, OAuth-only account and wrong password are one error.
        let user = self
            .users
            .find_by_email(&email)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        let hash = user
            .password_hash
            .clone()
            .ok_or(AuthError::InvalidCredentials)?;
        if !self.verify_password(password, hash).await? {
            return Err(AuthError::InvalidCredentials);
        }

        info!(user_id = %user.id, "login succeeded");
        self.issue_session(&user).await
    }

    /// Exchange a refresh token for a new pair, consuming the presented one.
    pub async fn refresh(&self, refresh_token: &str) -> Result<Session, AuthError> {
        let claims = self
            .codec
            .verify_kind(refresh_token, TokenKind::Refresh)
            .ok_or(AuthError::InvalidToken)?;

        let user = match self.users.find_by_id(claims.sub).await? {
            Some(user) => user,
            None => return Err(AuthError::TokenRevokedOrExpired),
        };

        let pair = self.codec.issue_pair(user.id, &user.email)?;
        let rotated = self
            .tokens
            .rotate(
                refresh_token,
                user.id,
                &pair.refresh_token,
                pair.refresh_expires_at,
            )
            .await?;
        if !rotated {
            // Signature was fine but the store no longer honours the token:
            // it was already rotated, revoked at logout, or expired server-side.
            warn!(user_id = %user.id, "rejected revoked or reused refresh token");
            return Err(AuthError::TokenRevokedOrExpired);
        }

        info!(user_id = %user.id, "refresh token rotated");
        Ok(Session {
            tokens: pair,
            user: user.view(),
        })
    }

    /// Revoke every refresh token of the user. Always succeeds when the store does.
    pub async fn logout(&self, user_id: Uuid) -> Result<(), AuthError> {
        let revoked = self.tokens.revoke_all(user_id).await?;
        info!(user_id = %user_id, revoked, "logged out");
        Ok(())
    }

    pub async fn current_user(&self, user_id: Uuid) -> Result<Option<User>, AuthError> {
        self.users.find_by_id(user_id).await
    }

    /// Issue and persist a fresh pair for an already authenticated user.
    pub async fn issue_session(&self, user: &User) -> Result<Session, AuthError> {
        let tokens = self.codec.issue_pair(user.id, &user.email)?;
        self.tokens
            .persist(user.id, &tokens.refresh_token, tokens.refresh_expires_at)
            .await?;
        Ok(Session {
            tokens,
            user: user.view(),
        })
    }

    async fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        let hasher = self.hasher;
        let password = password.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| AuthError::Internal(format!("hash task: {e}")))?
    }

    async fn verify_password(&self, password: &str, hash: String) -> Result<bool, AuthError> {
        let hasher = self.hasher;
        let password = password.to_string();
        tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .map_err(|e| AuthError::Internal(format!("verify task: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::memory::MemoryStore;
    use chrono::Duration;

    fn service_with(store: Arc<MemoryStore>) -> AuthSessionService {
        let codec = TokenCodec::new(b"session-test", Duration::minutes(15), Duration::days(7));
        AuthSessionService::new(
            store.clone(),
            store,
            codec,
            PasswordHasher::new(crate::auth::password::MIN_COST),
        )
    }

    fn service() -> (AuthSessionService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (service_with(store.clone()), store)
    }

    #[tokio::test]
    async fn register_then_login() {
        let (svc, _) = service();
        let registered = svc.register("a@x.com", "pw123456", "Alice").await.unwrap();
        assert_eq!(registered.user.email, "a@x.com");
        assert_eq!(registered.user.name, "Alice");
        assert_eq!(registered.user.provider, "local");

        let session = svc.login("a@x.com", "pw123456").await.unwrap();
        let claims = svc
            .codec()
            .verify_kind(&session.tokens.access_token, TokenKind::Access)
            .expect("access token verifies");
        assert_eq!(claims.sub, registered.user.id);
    }

    #[tokio::test]
    async fn email_is_normalized() {
        let (svc, _) = service();
        svc.register("  Alice@X.com ", "pw123456", "Alice")
            .await
            .unwrap();
        let session = svc.login("alice@x.COM", "pw123456").await.unwrap();
        assert_eq!(session.user.email, "alice@x.com");
    }

    #[tokio::test]
    async fn duplicate_registration_creates_no_row() {
        let (svc, store) = service();
        svc.register("a@x.com", "pw123456", "Alice").await.unwrap();

        let err = svc.register("A@x.com", "other-pw", "Eve").await.unwrap_err();
        assert!(matches!(err, AuthError::DuplicateEmail));
        assert_eq!(store.user_count().await, 1);
    }

    #[tokio::test]
    async fn registration_is_validated() {
        let (svc, store) = service();
        for (email, password, name) in [
            ("not-an-email", "pw123456", "Alice"),
            ("a@x.com", "short", "Alice"),
            ("a@x.com", "pw123456", "   "),
        ] {
            let err = svc.register(email, password, name).await.unwrap_err();
            assert!(matches!(err, AuthError::Validation(_)), "{email}/{password}/{name}");
        }
        assert_eq!(store.user_count().await, 0);
    }

    #[tokio::test]
    async fn login_failures_are_indistinguishable() {
        let (svc, store) = service();
        svc.register("a@x.com", "pw123456", "Alice").await.unwrap();
        store
            .create(NewUser {
                email: "oauth@x.com".into(),
                password_hash: None,
                name: "OAuth".into(),
                avatar_url: None,
                provider: "github".into(),
                provider_id: Some("42".into()),
            })
            .await
            .unwrap();

        let unknown = svc.login("nobody@x.com", "pw123456").await.unwrap_err();
        let wrong = svc.login("a@x.com", "wrong-password").await.unwrap_err();
        let oauth_only = svc.login("oauth@x.com", "anything").await.unwrap_err();

        for err in [&unknown, &wrong, &oauth_only] {
            assert!(matches!(err, AuthError::InvalidCredentials));
        }
        assert_eq!(unknown.to_string(), wrong.to_string());
        assert_eq!(wrong.to_string(), oauth_only.to_string());
    }

    #[tokio::test]
    async fn refresh_rotates_and_rejects_reuse() {
        let (svc, _) = service();
        let first = svc.register("a@x.com", "pw123456", "Alice").await.unwrap();

        let second = svc.refresh(&first.tokens.refresh_token).await.unwrap();
        assert_ne!(second.tokens.refresh_token, first.tokens.refresh_token);
        assert_eq!(second.user.id, first.user.id);

        let reused = svc.refresh(&first.tokens.refresh_token).await.unwrap_err();
        assert!(matches!(reused, AuthError::TokenRevokedOrExpired));

        // The new branch keeps working.
        svc.refresh(&second.tokens.refresh_token).await.unwrap();
    }

    #[tokio::test]
    async fn refresh_rejects_bad_tokens() {
        let (svc, _) = service();
        let session = svc.register("a@x.com", "pw123456", "Alice").await.unwrap();

        let garbage = svc.refresh("garbage").await.unwrap_err();
        assert!(matches!(garbage, AuthError::InvalidToken));

        // An access token is not a refresh token.
        let wrong_kind = svc.refresh(&session.tokens.access_token).await.unwrap_err();
        assert!(matches!(wrong_kind, AuthError::InvalidToken));

        // Validly signed but never persisted.
        let unknown = svc
            .codec()
            .issue_refresh(session.user.id, "a@x.com")
            .unwrap();
        let err = svc.refresh(&unknown).await.unwrap_err();
        assert!(matches!(err, AuthError::TokenRevokedOrExpired));
    }

    #[tokio::test]
    async fn logout_revokes_every_refresh_token() {
        let (svc, _) = service();
        let a = svc.register("a@x.com", "pw123456", "Alice").await.unwrap();
        let b = svc.login("a@x.com", "pw123456").await.unwrap();

        svc.logout(a.user.id).await.unwrap();
        // Idempotent, also with nothing left to revoke.
        svc.logout(a.user.id).await.unwrap();
        svc.logout(Uuid::new_v4()).await.unwrap();

        for token in [&a.tokens.refresh_token, &b.tokens.refresh_token] {
            let err = svc.refresh(token).await.unwrap_err();
            assert!(matches!(err, AuthError::TokenRevokedOrExpired));
        }

        // Access tokens stay valid until they expire.
        assert!(
            svc.codec()
                .verify_kind(&a.tokens.access_token, TokenKind::Access)
                .is_some()
        );
    }

    #[tokio::test]
    async fn concurrent_refresh_has_exactly_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let svc = Arc::new(service_with(store));
        let session = svc.register("a@x.com", "pw123456", "Alice").await.unwrap();
        let token = session.tokens.refresh_token;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let svc = Arc::clone(&svc);
            let token = token.clone();
            handles.push(tokio::spawn(async move { svc.refresh(&token).await }));
        }

        let mut wins = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(AuthError::TokenRevokedOrExpired) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(rejected, 7);
    }

    #[tokio::test]
    async fn current_user_is_a_plain_lookup() {
        let (svc, _) = service();
        let session = svc.register("a@x.com", "pw123456", "Alice").await.unwrap();

        let user = svc.current_user(session.user.id).await.unwrap().unwrap();
        assert_eq!(user.email, "a@x.com");
        assert!(user.password_hash.is_some());
        assert!(svc.current_user(Uuid::new_v4()).await.unwrap().is_none());
    }
}
