//! JWT token generation and verification.
//!
//! Access and refresh tokens share one HS256 signing scheme and one claims
//! shape; they differ only in the `typ` claim and their lifetime. Verification
//! here is purely computational. Whether a refresh token is still usable is
//! decided by the [`RefreshTokenStore`](super::store::RefreshTokenStore).

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use tracing::info;
use uuid::Uuid;

use super::AuthError;
use crate::models::auth::{Principal, TokenClaims, TokenKind, TokenPair};

/// Default access token lifetime: 15 minutes.
pub const DEFAULT_ACCESS_TTL_SECS: i64 = 15 * 60;

/// Default refresh token lifetime: 7 days.
pub const DEFAULT_REFRESH_TTL_SECS: i64 = 7 * 24 * 60 * 60;

/// Signs and verifies access and refresh tokens.
#[derive(Clone)]
pub struct TokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenCodec {
    /// Build a codec from the server secret and the two token lifetimes.
    pub fn new(secret: &[u8], access_ttl: Duration, refresh_ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            access_ttl,
            refresh_ttl,
        }
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    /// Generate a signed access token.
    pub fn issue_access(&self, user_id: Uuid, email: &str) -> Result<String, AuthError> {
        self.issue(TokenKind::Access, user_id, email, Utc::now())
            .map(|(token, _)| token)
    }

    /// Generate a signed refresh token.
    pub fn issue_refresh(&self, user_id: Uuid, email: &str) -> Result<String, AuthError> {
        self.issue(TokenKind::Refresh, user_id, email, Utc::now())
            .map(|(token, _)| token)
    }

    /// Generate an access + refresh pair sharing one issue instant.
    pub fn issue_pair(&self, user_id: Uuid, email: &str) -> Result<TokenPair, AuthError> {
        let now = Utc::now();
        let (access_token, _) = self.issue(TokenKind::Access, user_id, email, now)?;
        let (refresh_token, refresh_expires_at) =
            self.issue(TokenKind::Refresh, user_id, email, now)?;
        Ok(TokenPair {
            access_token,
            refresh_token,
            access_expires_in: self.access_ttl.num_seconds(),
            refresh_expires_in: self.refresh_ttl.num_seconds(),
            refresh_expires_at,
        })
    }

    fn issue(
        &self,
        kind: TokenKind,
        user_id: Uuid,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<(String, DateTime<Utc>), AuthError> {
        let ttl = match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        };
        let expires_at = now + ttl;
        let claims = TokenClaims {
            sub: user_id,
            email: email.to_string(),
            typ: kind,
            jti: Uuid::new_v4(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Internal(format!("jwt encode: {e}")))?;
        Ok((token, expires_at))
    }

    /// Verify signature, structure and expiry, returning the claims on success.
    pub fn verify(&self, token: &str) -> Option<TokenClaims> {
        decode::<TokenClaims>(token, &self.decoding, &self.validation)
            .ok()
            .map(|data| data.claims)
    }

    /// Like [`verify`](Self::verify), additionally requiring a token kind.
    pub fn verify_kind(&self, token: &str, kind: TokenKind) -> Option<TokenClaims> {
        self.verify(token).filter(|claims| claims.typ == kind)
    }

    /// Subject id of a token that verifies.
    pub fn subject_id(&self, token: &str) -> Option<Uuid> {
        self.verify(token).map(|claims| claims.sub)
    }
}

/// Capability handed to anything that only needs to know who is calling.
///
/// Resource handlers depend on this rather than on the session service, so the
/// authentication core can be swapped without touching them.
pub trait Authenticator: Send + Sync {
    /// Resolve an access token to a verified principal, or `Unauthenticated`.
    fn verify_access(&self, token: &str) -> Result<Principal, AuthError>;
}

impl Authenticator for TokenCodec {
    fn verify_access(&self, token: &str) -> Result<Principal, AuthError> {
        self.verify_kind(token, TokenKind::Access)
            .map(|claims| Principal {
                user_id: claims.sub,
                email: claims.email,
            })
            .ok_or(AuthError::Unauthenticated)
    }
}

/// Resolve the JWT secret: `JWT_SECRET` → `AUTH_SECRET` → persisted file.
pub fn resolve_jwt_secret(lookup: impl Fn(&str) -> Option<String>) -> String {
    for key in ["JWT_SECRET", "AUTH_SECRET"] {
        if let Some(secret) = lookup(key)
            && !secret.is_empty()
        {
            return secret;
        }
    }
    // Generate and persist
    let secret_path = jwt_secret_path();
    if let Ok(existing) = std::fs::read_to_string(&secret_path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    let secret: String = rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect();
    if let Some(parent) = secret_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::write(&secret_path, &secret);
    info!(path = %secret_path.display(), "generated new JWT secret");
    secret
}

/// Path to the persisted JWT secret file.
fn jwt_secret_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("coursekeep")
        .join("jwt-secret")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret-for-token-codec";

    fn codec() -> TokenCodec {
        TokenCodec::new(SECRET, Duration::minutes(15), Duration::days(7))
    }

    #[test]
    fn access_token_round_trips_claims() {
        let codec = codec();
        let user_id = Uuid::new_v4();
        let token = codec.issue_access(user_id, "a@x.com").unwrap();

        let claims = codec.verify(&token).expect("valid token");
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.email, "a@x.com");
        assert_eq!(claims.typ, TokenKind::Access);
        assert_eq!(claims.exp - claims.iat, 15 * 60);
        assert_eq!(codec.subject_id(&token), Some(user_id));
    }

    #[test]
    fn pair_has_distinct_kinds_and_lifetimes() {
        let codec = codec();
        let pair = codec.issue_pair(Uuid::new_v4(), "a@x.com").unwrap();

        assert!(codec.verify_kind(&pair.access_token, TokenKind::Access).is_some());
        assert!(codec.verify_kind(&pair.refresh_token, TokenKind::Refresh).is_some());
        assert_eq!(pair.access_expires_in, 15 * 60);
        assert_eq!(pair.refresh_expires_in, 7 * 24 * 60 * 60);
        assert!(pair.refresh_expires_at > Utc::now() + Duration::days(6));
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let codec = codec();
        let pair = codec.issue_pair(Uuid::new_v4(), "a@x.com").unwrap();

        assert!(codec.verify_kind(&pair.refresh_token, TokenKind::Access).is_none());
        assert!(codec.verify_kind(&pair.access_token, TokenKind::Refresh).is_none());
        assert!(codec.verify_access(&pair.refresh_token).is_err());
    }

    #[test]
    fn tokens_minted_together_are_distinct() {
        let codec = codec();
        let user_id = Uuid::new_v4();
        let a = codec.issue_refresh(user_id, "a@x.com").unwrap();
        let b = codec.issue_refresh(user_id, "a@x.com").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn expired_token_fails() {
        let codec = TokenCodec::new(SECRET, Duration::seconds(-5), Duration::seconds(-5));
        let token = codec.issue_access(Uuid::new_v4(), "a@x.com").unwrap();
        assert!(codec.verify(&token).is_none());
    }

    #[test]
    fn wrong_secret_fails() {
        let token = codec().issue_access(Uuid::new_v4(), "a@x.com").unwrap();
        let other = TokenCodec::new(b"another-secret", Duration::minutes(15), Duration::days(7));
        assert!(other.verify(&token).is_none());
    }

    #[test]
    fn malformed_input_fails() {
        let codec = codec();
        assert!(codec.verify("").is_none());
        assert!(codec.verify("not.a.jwt").is_none());
        assert!(codec.verify("a.b").is_none());
    }

    #[test]
    fn flipping_any_byte_invalidates_the_token() {
        let codec = codec();
        let token = codec.issue_access(Uuid::new_v4(), "a@x.com").unwrap();
        let bytes = token.as_bytes();

        for i in 0..bytes.len() {
            let mut tampered = bytes.to_vec();
            tampered[i] = if tampered[i] == b'A' { b'B' } else { b'A' };
            let tampered = String::from_utf8(tampered).unwrap();
            assert!(
                codec.verify(&tampered).is_none(),
                "tampered byte {i} still verified"
            );
        }
    }

    #[test]
    fn authenticator_yields_principal() {
        let codec = codec();
        let user_id = Uuid::new_v4();
        let token = codec.issue_access(user_id, "a@x.com").unwrap();

        let principal = codec.verify_access(&token).unwrap();
        assert_eq!(principal.user_id, user_id);
        assert!(matches!(
            codec.verify_access("garbage"),
            Err(AuthError::Unauthenticated)
        ));
    }

    #[test]
    fn explicit_secret_wins() {
        let secret = resolve_jwt_secret(|key| match key {
            "JWT_SECRET" => Some("from-env".to_string()),
            _ => None,
        });
        assert_eq!(secret, "from-env");

        let fallback = resolve_jwt_secret(|key| match key {
            "JWT_SECRET" => Some(String::new()),
            "AUTH_SECRET" => Some("auth-secret".to_string()),
            _ => None,
        });
        assert_eq!(fallback, "auth-secret");
    }
}
