//! Authorization-code flow against external providers.
//!
//! Provides PKCE state management, the authorize redirect, token exchange and
//! profile fetch.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use url::Url;

use super::OAuthProfile;
use super::providers::{ProviderSpec, primary_email, provider};
use crate::auth::AuthError;

/// TTL for pending authorization entries (10 minutes).
const STATE_TTL: Duration = Duration::from_secs(600);

/// Default bound on concurrently pending authorizations.
pub const DEFAULT_MAX_PENDING: usize = 10_000;

const EXCHANGE_FAILED: &str = "Token exchange failed";
const PROFILE_FAILED: &str = "Could not fetch the provider profile";

const USER_AGENT: &str = concat!("coursekeep/", env!("CARGO_PKG_VERSION"));

// =============================================================================
// PKCE helpers
// =============================================================================

/// Generate a cryptographic PKCE code verifier (43–128 chars, URL-safe).
pub fn generate_code_verifier() -> String {
    use base64::Engine;
    use rand::RngCore;

    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Compute S256 code challenge from a code verifier.
pub fn compute_code_challenge(verifier: &str) -> String {
    use base64::Engine;

    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

/// Generate a cryptographic state parameter (CSRF token).
pub fn generate_state() -> String {
    use base64::Engine;
    use rand::RngCore;

    let mut bytes = [0u8; 24];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

// =============================================================================
// Pending authorization store
// =============================================================================

/// Stored between the authorize redirect and the callback.
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    pub provider: String,
    pub pkce_verifier: String,
    pub redirect_uri: String,
    pub created_at: Instant,
}

impl PendingAuthorization {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > STATE_TTL
    }
}

/// In-memory store of pending authorizations, keyed by `state`.
///
/// Entries are created by unauthenticated requests, so the store is bounded:
/// once `max_pending` entries are live, expired ones are swept inline and
/// new flows are refused if that frees nothing.
pub struct OAuthStateStore {
    states: DashMap<String, PendingAuthorization>,
    max_pending: usize,
    /// Slots reserved or occupied in `states`.
    live: AtomicUsize,
}

impl OAuthStateStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_PENDING)
    }

    pub fn with_capacity(max_pending: usize) -> Self {
        Self {
            states: DashMap::new(),
            max_pending,
            live: AtomicUsize::new(0),
        }
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Record a pending flow. Fails when the store is full of live entries.
    pub fn insert(&self, state_key: String, pending: PendingAuthorization) -> Result<(), AuthError> {
        self.insert_at(state_key, pending, Instant::now())
    }

    pub fn insert_at(
        &self,
        state_key: String,
        pending: PendingAuthorization,
        now: Instant,
    ) -> Result<(), AuthError> {
        if !self.reserve_slot() {
            self.cleanup_at(now);
            if !self.reserve_slot() {
                warn!(max = self.max_pending, "too many pending OAuth authorizations");
                return Err(AuthError::OAuth(
                    "Too many sign-in attempts in progress, try again later".into(),
                ));
            }
        }
        if self.states.insert(state_key, pending).is_some() {
            // Replaced an entry with the same key; it already held a slot.
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }

    fn reserve_slot(&self) -> bool {
        let max = self.max_pending;
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_ok()
    }

    /// Take (remove and return) a pending entry.
    /// Returns `None` if not found or expired.
    pub fn take(&self, state_key: &str) -> Option<PendingAuthorization> {
        self.take_at(state_key, Instant::now())
    }

    pub fn take_at(&self, state_key: &str, now: Instant) -> Option<PendingAuthorization> {
        let (_, pending) = self.states.remove(state_key)?;
        self.live.fetch_sub(1, Ordering::AcqRel);
        (!pending.is_expired(now)).then_some(pending)
    }

    /// Evict expired entries. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&self, now: Instant) -> usize {
        let mut evicted = 0;
        self.states.retain(|_, pending| {
            let expired = pending.is_expired(now);
            evicted += usize::from(expired);
            !expired
        });
        self.live.fetch_sub(evicted, Ordering::AcqRel);
        evicted
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Spawn a periodic cleanup task.
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let evicted = store.cleanup();
                if evicted > 0 {
                    debug!(evicted, pending = store.len(), "oauth state cleanup");
                }
            }
        })
    }
}

impl Default for OAuthStateStore {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Provider client
// =============================================================================

/// Client credentials registered with a provider.
#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Response from a provider's token endpoint.
#[derive(Debug, Deserialize)]
pub struct ProviderTokenResponse {
    pub access_token: String,
    pub token_type: Option<String>,
    pub scope: Option<String>,
}

/// Where a provider's endpoints live. Defaults come from its [`ProviderSpec`];
/// self-hosted deployments and tests point them elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoints {
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub emails_url: Option<String>,
}

impl From<&ProviderSpec> for ProviderEndpoints {
    fn from(spec: &ProviderSpec) -> Self {
        Self {
            authorize_url: spec.authorize_url.to_string(),
            token_url: spec.token_url.to_string(),
            userinfo_url: spec.userinfo_url.to_string(),
            emails_url: spec.emails_url.map(str::to_string),
        }
    }
}

struct Registration {
    spec: &'static ProviderSpec,
    endpoints: ProviderEndpoints,
    credentials: ProviderCredentials,
}

/// Drives the authorization-code flow for every configured provider.
pub struct OAuthClient {
    http: reqwest::Client,
    registrations: HashMap<&'static str, Registration>,
    states: Arc<OAuthStateStore>,
}

impl OAuthClient {
    /// Build a client from `(provider name, credentials)` pairs. Unknown names
    /// are skipped with a warning.
    pub fn new(configured: impl IntoIterator<Item = (String, ProviderCredentials)>) -> Self {
        let mut registrations = HashMap::new();
        for (name, credentials) in configured {
            match provider(&name) {
                Some(spec) => {
                    let registration = Registration {
                        spec,
                        endpoints: ProviderEndpoints::from(spec),
                        credentials,
                    };
                    registrations.insert(spec.name, registration);
                }
                None => warn!(provider = %name, "ignoring unknown OAuth provider"),
            }
        }
        Self {
            http: reqwest::Client::new(),
            registrations,
            states: Arc::new(OAuthStateStore::new()),
        }
    }

    /// Replace the endpoints of a configured provider.
    pub fn with_endpoints(mut self, provider: &str, endpoints: ProviderEndpoints) -> Self {
        match self.registrations.get_mut(provider) {
            Some(reg) => reg.endpoints = endpoints,
            None => warn!(provider, "endpoint override for unconfigured OAuth provider"),
        }
        self
    }

    /// Bound the number of concurrently pending authorizations.
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.states = Arc::new(OAuthStateStore::with_capacity(max_pending));
        self
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn is_enabled(&self, provider: &str) -> bool {
        self.registrations.contains_key(provider)
    }

    pub fn states(&self) -> &Arc<OAuthStateStore> {
        &self.states
    }

    fn registration(&self, provider: &str) -> Result<&Registration, AuthError> {
        self.registrations
            .get(provider)
            .ok_or_else(|| {
                debug!(provider, "oauth flow for unconfigured provider");
                AuthError::OAuth("Unsupported OAuth provider".into())
            })
    }

    /// Record a pending authorization and return the provider URL to redirect to.
    pub fn authorize_url(&self, provider: &str, redirect_uri: &str) -> Result<Url, AuthError> {
        let reg = self.registration(provider)?;
        let state = generate_state();
        let verifier = generate_code_verifier();
        let challenge = compute_code_challenge(&verifier);
        let scope = reg.spec.scopes.join(" ");

        let url = Url::parse_with_params(
            &reg.endpoints.authorize_url,
            &[
                ("response_type", "code"),
                ("client_id", reg.credentials.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("scope", scope.as_str()),
                ("state", state.as_str()),
                ("code_challenge", challenge.as_str()),
                ("code_challenge_method", "S256"),
            ],
        )
        .map_err(|e| AuthError::Internal(format!("authorize url: {e}")))?;

        self.states.insert(
            state,
            PendingAuthorization {
                provider: reg.spec.name.to_string(),
                pkce_verifier: verifier,
                redirect_uri: redirect_uri.to_string(),
                created_at: Instant::now(),
            },
        )?;
        Ok(url)
    }

    /// Finish the flow: validate `state`, exchange `code`, fetch the profile.
    pub async fn complete(
        &self,
        provider: &str,
        code: &str,
        state: &str,
    ) -> Result<OAuthProfile, AuthError> {
        let reg = self.registration(provider)?;
        let pending = self
            .states
            .take(state)
            .filter(|p| p.provider == reg.spec.name)
            .ok_or_else(|| AuthError::OAuth("Invalid or expired authorization state".into()))?;

        let tokens = exchange_authorization_code(
            &self.http,
            &reg.endpoints.token_url,
            &reg.credentials,
            code,
            &pending.redirect_uri,
            &pending.pkce_verifier,
        )
        .await?;

        let payload = self
            .get_json(&reg.endpoints.userinfo_url, &tokens.access_token)
            .await?;
        let mut profile = reg.spec.extract(&payload)?;

        if profile.email.is_none()
            && let Some(emails_url) = &reg.endpoints.emails_url
        {
            debug!(provider = reg.spec.name, "profile email hidden, querying email listing");
            let listing = self.get_json(emails_url, &tokens.access_token).await?;
            profile.email = primary_email(&listing);
        }
        Ok(profile)
    }

    async fn get_json(&self, url: &str, access_token: &str) -> Result<Value, AuthError> {
        let resp = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                warn!(url, error = %e, "profile request failed");
                AuthError::OAuth(PROFILE_FAILED.into())
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(url, %status, body = %body, "profile request rejected");
            return Err(AuthError::OAuth(PROFILE_FAILED.into()));
        }

        resp.json::<Value>().await.map_err(|e| {
            warn!(url, error = %e, "unparsable profile response");
            AuthError::OAuth(PROFILE_FAILED.into())
        })
    }
}

/// Exchange an authorization code for provider tokens.
pub async fn exchange_authorization_code(
    http: &reqwest::Client,
    token_url: &str,
    credentials: &ProviderCredentials,
    code: &str,
    redirect_uri: &str,
    code_verifier: &str,
) -> Result<ProviderTokenResponse, AuthError> {
    let params = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("client_id", credentials.client_id.as_str()),
        ("client_secret", credentials.client_secret.as_str()),
        ("redirect_uri", redirect_uri),
        ("code_verifier", code_verifier),
    ];

    // GitHub answers form-encoded unless JSON is asked for.
    let resp = http
        .post(token_url)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(&params)
        .send()
        .await
        .map_err(|e| {
            warn!(token_url, error = %e, "token exchange request failed");
            AuthError::OAuth(EXCHANGE_FAILED.into())
        })?;

    // Provider bodies stay in the log; callers only ever see the fixed text.
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        warn!(token_url, %status, body = %body, "token exchange rejected");
        return Err(AuthError::OAuth(EXCHANGE_FAILED.into()));
    }

    resp.json::<ProviderTokenResponse>().await.map_err(|e| {
        warn!(token_url, error = %e, "unparsable token response");
        AuthError::OAuth(EXCHANGE_FAILED.into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> OAuthClient {
        OAuthClient::new([(
            "github".to_string(),
            ProviderCredentials {
                client_id: "cid".into(),
                client_secret: "secret".into(),
            },
        )])
    }

    fn pending(provider: &str, created_at: Instant) -> PendingAuthorization {
        PendingAuthorization {
            provider: provider.into(),
            pkce_verifier: "verifier".into(),
            redirect_uri: "http://localhost/callback".into(),
            created_at,
        }
    }

    const PAST_TTL: Duration = Duration::from_secs(700);

    #[test]
    fn code_verifier_is_url_safe_and_sufficient_length() {
        let verifier = generate_code_verifier();
        assert!(verifier.len() >= 43, "verifier too short: {}", verifier.len());
        assert!(
            verifier
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
            "verifier contains non-URL-safe chars: {verifier}"
        );
    }

    #[test]
    fn code_challenge_is_s256_of_verifier() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        // RFC 7636 test vector
        assert_eq!(
            compute_code_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn state_store_take_is_single_use() {
        let store = OAuthStateStore::new();
        store.insert("k".into(), pending("github", Instant::now())).unwrap();

        assert_eq!(store.take("k").unwrap().provider, "github");
        assert!(store.take("k").is_none());
    }

    #[test]
    fn state_store_drops_expired_entries() {
        let store = OAuthStateStore::new();
        let t0 = Instant::now();
        store.insert("old".into(), pending("github", t0)).unwrap();
        store.insert("new".into(), pending("github", t0 + PAST_TTL)).unwrap();

        let later = t0 + PAST_TTL;
        assert_eq!(store.cleanup_at(later), 1);
        assert_eq!(store.len(), 1);
        assert!(store.take_at("new", later).is_some());

        store.insert("late".into(), pending("github", t0)).unwrap();
        assert!(store.take_at("late", later).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn full_state_store_fails_closed() {
        let store = OAuthStateStore::with_capacity(2);
        let t0 = Instant::now();
        store.insert("a".into(), pending("github", t0)).unwrap();
        store.insert("b".into(), pending("github", t0)).unwrap();

        let err = store.insert("c".into(), pending("github", t0));
        assert!(matches!(err, Err(AuthError::OAuth(_))));
        assert_eq!(store.len(), 2);

        // Completing a flow frees its slot.
        assert!(store.take("a").is_some());
        store.insert("c".into(), pending("github", t0)).unwrap();
    }

    #[test]
    fn full_state_store_sweeps_expired_entries_first() {
        let store = OAuthStateStore::with_capacity(2);
        let t0 = Instant::now();
        let later = t0 + PAST_TTL;
        store.insert_at("stale".into(), pending("github", t0), t0).unwrap();
        store.insert_at("fresh".into(), pending("github", later), later).unwrap();

        store.insert_at("new".into(), pending("github", later), later).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.take_at("stale", later).is_none());
        assert!(store.take_at("new", later).is_some());
    }

    #[test]
    fn concurrent_authorizations_respect_the_bound() {
        let client = client().with_max_pending(16);
        let redirected: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..64)
                .map(|_| {
                    s.spawn(|| {
                        client
                            .authorize_url("github", "http://localhost/cb")
                            .is_ok() as usize
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(redirected, 16);
        assert_eq!(client.states().len(), 16);
    }

    #[test]
    fn endpoint_overrides_drive_the_authorize_url() {
        let client = client().with_endpoints(
            "github",
            ProviderEndpoints {
                authorize_url: "http://127.0.0.1:9/authorize".into(),
                ..ProviderEndpoints::from(&crate::auth::oauth::providers::GITHUB)
            },
        );
        let url = client.authorize_url("github", "http://localhost/cb").unwrap();
        assert_eq!(url.host_str(), Some("127.0.0.1"));
        assert_eq!(url.path(), "/authorize");
    }

    #[test]
    fn authorize_url_carries_pkce_and_state() {
        let client = client();
        let url = client
            .authorize_url("github", "http://localhost:8080/login/oauth2/code/github")
            .unwrap();

        assert_eq!(url.host_str(), Some("github.com"));
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["client_id"], "cid");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["scope"], "read:user user:email");

        let pending = client.states().take(&params["state"]).unwrap();
        assert_eq!(pending.provider, "github");
        assert_eq!(
            compute_code_challenge(&pending.pkce_verifier),
            params["code_challenge"]
        );
    }

    #[test]
    fn unconfigured_provider_is_rejected() {
        let client = client();
        assert!(client.is_enabled("github"));
        assert!(!client.is_enabled("google"));
        assert!(matches!(
            client.authorize_url("google", "http://localhost/cb"),
            Err(AuthError::OAuth(_))
        ));
    }

    #[tokio::test]
    async fn complete_rejects_unknown_or_foreign_state() {
        let client = client();
        let err = client.complete("github", "code", "never-issued").await;
        assert!(matches!(err, Err(AuthError::OAuth(_))));

        // A state minted for one provider cannot finish another's flow.
        client
            .states()
            .insert("s".into(), pending("google", Instant::now()))
            .unwrap();
        let err = client.complete("github", "code", "s").await;
        assert!(matches!(err, Err(AuthError::OAuth(_))));
    }

    #[tokio::test]
    async fn spawn_cleanup_task_runs() {
        let store = Arc::new(OAuthStateStore::new());
        let handle = store.spawn_cleanup_task();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
    }
}
