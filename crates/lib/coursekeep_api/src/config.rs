//! API server configuration.

use std::str::FromStr;
use std::time::Duration;

use coursekeep_core::auth::jwt::{DEFAULT_ACCESS_TTL_SECS, DEFAULT_REFRESH_TTL_SECS, resolve_jwt_secret};
use coursekeep_core::auth::oauth::client::{DEFAULT_MAX_PENDING, ProviderCredentials};
use coursekeep_core::auth::oauth::providers::PROVIDERS;
use coursekeep_core::auth::password::DEFAULT_COST;
use coursekeep_core::rate_limit::{BucketConfig, RateLimitConfig};
use tracing::warn;

/// Dev frontend origin, always allowed by CORS.
pub const DEV_FRONTEND_URL: &str = "http://localhost:5173";

/// Configuration for the API server.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// Address to bind the HTTP listener (e.g. "127.0.0.1:8080").
    pub bind_addr: String,
    /// PostgreSQL connection URL.
    pub pg_connection_url: String,
    /// JWT signing secret.
    pub jwt_secret: String,
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    pub bcrypt_cost: u32,
    /// Sets the `Secure` cookie attribute. Off for plain-HTTP development.
    pub cookie_secure: bool,
    pub cookie_domain: Option<String>,
    /// Frontend origins. The first one is the redirect target after OAuth.
    pub frontend_urls: Vec<String>,
    /// External base URL of this server, used for OAuth redirect URIs.
    pub public_url: String,
    pub rate_limit: RateLimitConfig,
    /// Enabled OAuth providers with their client credentials.
    pub oauth_providers: Vec<(String, ProviderCredentials)>,
    /// Bound on OAuth flows started but not yet completed.
    pub oauth_max_pending: usize,
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "ignoring unparsable configuration value");
            default
        }),
        None => default,
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl ApiConfig {
    /// Reads configuration from environment variables with sensible defaults.
    ///
    /// | Variable                          | Default                                 |
    /// |-----------------------------------|-----------------------------------------|
    /// | `BIND_ADDR`                       | `127.0.0.1:8080`                        |
    /// | `DATABASE_URL`                    | `postgres://localhost:5432/coursekeep`  |
    /// | `JWT_SECRET` / `AUTH_SECRET`      | generated & persisted to file           |
    /// | `JWT_ACCESS_TTL_SECS`             | `900`                                   |
    /// | `JWT_REFRESH_TTL_SECS`            | `604800`                                |
    /// | `BCRYPT_COST`                     | `10`                                    |
    /// | `COOKIE_SECURE`                   | `false`                                 |
    /// | `COOKIE_DOMAIN`                   | unset                                   |
    /// | `FRONTEND_URL`                    | `http://localhost:5173` (comma list)    |
    /// | `PUBLIC_URL`                      | `http://localhost:8080`                 |
    /// | `RATE_LIMIT_AUTH_CAPACITY`        | `5`                                     |
    /// | `RATE_LIMIT_AUTH_WINDOW_SECS`     | `60`                                    |
    /// | `RATE_LIMIT_REFRESH_CAPACITY`     | `10`                                    |
    /// | `RATE_LIMIT_REFRESH_WINDOW_SECS`  | `60`                                    |
    /// | `RATE_LIMIT_MAX_KEYS`             | `100000`                                |
    /// | `OAUTH_<PROVIDER>_CLIENT_ID` / `_CLIENT_SECRET` | unset (provider disabled) |
    /// | `OAUTH_MAX_PENDING`               | `10000`                                 |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but reading from an arbitrary source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = RateLimitConfig::default();
        let bucket = |prefix: &str, default: BucketConfig| {
            BucketConfig::new(
                parse_or(&lookup, &format!("{prefix}_CAPACITY"), default.capacity),
                Duration::from_secs(parse_or(
                    &lookup,
                    &format!("{prefix}_WINDOW_SECS"),
                    default.window.as_secs(),
                )),
            )
        };
        let rate_limit = RateLimitConfig {
            credentials: bucket("RATE_LIMIT_AUTH", defaults.credentials),
            refresh: bucket("RATE_LIMIT_REFRESH", defaults.refresh),
            max_tracked_keys: parse_or(&lookup, "RATE_LIMIT_MAX_KEYS", defaults.max_tracked_keys),
        };

        let frontend_urls: Vec<String> = non_empty(&lookup, "FRONTEND_URL")
            .map(|raw| {
                raw.split(',')
                    .map(|u| u.trim().trim_end_matches('/').to_string())
                    .filter(|u| !u.is_empty())
                    .collect()
            })
            .filter(|urls: &Vec<String>| !urls.is_empty())
            .unwrap_or_else(|| vec![DEV_FRONTEND_URL.to_string()]);

        let oauth_providers = PROVIDERS
            .iter()
            .filter_map(|p| {
                let prefix = format!("OAUTH_{}", p.name.to_uppercase());
                let client_id = non_empty(&lookup, &format!("{prefix}_CLIENT_ID"))?;
                let client_secret = non_empty(&lookup, &format!("{prefix}_CLIENT_SECRET"))?;
                Some((
                    p.name.to_string(),
                    ProviderCredentials {
                        client_id,
                        client_secret,
                    },
                ))
            })
            .collect();

        Self {
            bind_addr: non_empty(&lookup, "BIND_ADDR").unwrap_or_else(|| "127.0.0.1:8080".into()),
            pg_connection_url: non_empty(&lookup, "DATABASE_URL")
                .unwrap_or_else(|| "postgres://localhost:5432/coursekeep".into()),
            jwt_secret: resolve_jwt_secret(&lookup),
            access_ttl_secs: parse_or(&lookup, "JWT_ACCESS_TTL_SECS", DEFAULT_ACCESS_TTL_SECS),
            refresh_ttl_secs: parse_or(&lookup, "JWT_REFRESH_TTL_SECS", DEFAULT_REFRESH_TTL_SECS),
            bcrypt_cost: parse_or(&lookup, "BCRYPT_COST", DEFAULT_COST),
            cookie_secure: parse_or(&lookup, "COOKIE_SECURE", false),
            cookie_domain: non_empty(&lookup, "COOKIE_DOMAIN"),
            frontend_urls,
            public_url: non_empty(&lookup, "PUBLIC_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "http://localhost:8080".into()),
            rate_limit,
            oauth_providers,
            oauth_max_pending: parse_or(&lookup, "OAUTH_MAX_PENDING", DEFAULT_MAX_PENDING),
        }
    }

    /// Where the browser lands after an OAuth login.
    pub fn frontend_url(&self) -> &str {
        self.frontend_urls
            .first()
            .map(String::as_str)
            .unwrap_or(DEV_FRONTEND_URL)
    }

    /// Origins allowed to make credentialed cross-origin requests.
    pub fn cors_origins(&self) -> Vec<String> {
        let mut origins = self.frontend_urls.clone();
        if !origins.iter().any(|o| o == DEV_FRONTEND_URL) {
            origins.push(DEV_FRONTEND_URL.to_string());
        }
        origins
    }

    /// OAuth redirect URI registered with `provider`.
    pub fn oauth_redirect_uri(&self, provider: &str) -> String {
        format!(
            "{}{}",
            self.public_url,
            crate::routes::oauth_callback_path(provider)
        )
    }
}
