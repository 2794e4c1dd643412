//! Cookie transport: set/get/clear httpOnly auth cookies.
//!
//! Both tokens travel only in cookies; response bodies never carry them.

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use coursekeep_core::models::auth::TokenPair;
use time::Duration;

use crate::config::ApiConfig;

/// Cookie name for the access token.
pub const ACCESS_COOKIE: &str = "access_token";
/// Cookie name for the refresh token.
pub const REFRESH_COOKIE: &str = "refresh_token";

/// Maps token pairs to and from response/request cookies.
#[derive(Clone, Debug, Default)]
pub struct SessionTransport {
    secure: bool,
    domain: Option<String>,
}

impl SessionTransport {
    pub fn new(secure: bool, domain: Option<String>) -> Self {
        Self { secure, domain }
    }

    pub fn from_config(config: &ApiConfig) -> Self {
        Self::new(config.cookie_secure, config.cookie_domain.clone())
    }

    /// Every auth cookie, set or cleared, goes through here so the
    /// attributes always match.
    fn cookie(&self, name: &'static str, value: String, max_age: Duration) -> Cookie<'static> {
        let mut builder = Cookie::build((name, value))
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .path("/")
            .max_age(max_age);
        if let Some(domain) = &self.domain {
            builder = builder.domain(domain.clone());
        }
        builder.build()
    }

    /// Add both token cookies, each living as long as its token.
    pub fn write(&self, jar: CookieJar, tokens: &TokenPair) -> CookieJar {
        jar.add(self.cookie(
            ACCESS_COOKIE,
            tokens.access_token.clone(),
            Duration::seconds(tokens.access_expires_in),
        ))
        .add(self.cookie(
            REFRESH_COOKIE,
            tokens.refresh_token.clone(),
            Duration::seconds(tokens.refresh_expires_in),
        ))
    }

    pub fn read_access(&self, jar: &CookieJar) -> Option<String> {
        read(jar, ACCESS_COOKIE)
    }

    pub fn read_refresh(&self, jar: &CookieJar) -> Option<String> {
        read(jar, REFRESH_COOKIE)
    }

    /// Overwrite both cookies with empty, immediately expiring values.
    pub fn clear(&self, jar: CookieJar) -> CookieJar {
        jar.add(self.cookie(ACCESS_COOKIE, String::new(), Duration::ZERO))
            .add(self.cookie(REFRESH_COOKIE, String::new(), Duration::ZERO))
    }
}

fn read(jar: &CookieJar, name: &str) -> Option<String> {
    jar.get(name)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}
