//! Known OAuth providers and their profile attribute names.
//!
//! Providers disagree on where the subject id, display name and avatar live
//! in their userinfo payload. Each entry maps those attributes once, so the
//! linking code only ever sees an [`OAuthProfile`].

use serde_json::Value;

use super::OAuthProfile;
use crate::auth::AuthError;

/// Where a provider keeps each profile attribute.
#[derive(Debug, Clone, Copy)]
pub struct AttributeMap {
    pub id: &'static str,
    pub email: &'static str,
    /// Flag that must be true for `email` to count. An address the provider
    /// has not verified is treated as absent, since linking is by email.
    pub email_verified: Option<&'static str>,
    /// Tried in order; the first non-empty string wins.
    pub name: &'static [&'static str],
    pub avatar: &'static str,
}

/// Static description of one OAuth provider.
#[derive(Debug, Clone, Copy)]
pub struct ProviderSpec {
    /// Registration id used in routes and stored as `users.provider`.
    pub name: &'static str,
    pub authorize_url: &'static str,
    pub token_url: &'static str,
    pub userinfo_url: &'static str,
    /// Secondary endpoint listing addresses when the profile hides the email.
    pub emails_url: Option<&'static str>,
    pub scopes: &'static [&'static str],
    pub attributes: AttributeMap,
}

pub const GITHUB: ProviderSpec = ProviderSpec {
    name: "github",
    authorize_url: "https://github.com/login/oauth/authorize",
    token_url: "https://github.com/login/oauth/access_token",
    userinfo_url: "https://api.github.com/user",
    emails_url: Some("https://api.github.com/user/emails"),
    scopes: &["read:user", "user:email"],
    attributes: AttributeMap {
        id: "id",
        email: "email",
        // Profile emails are verified; the listing is filtered separately.
        email_verified: None,
        name: &["name", "login"],
        avatar: "avatar_url",
    },
};

pub const GOOGLE: ProviderSpec = ProviderSpec {
    name: "google",
    authorize_url: "https://accounts.google.com/o/oauth2/v2/auth",
    token_url: "https://oauth2.googleapis.com/token",
    userinfo_url: "https://openidconnect.googleapis.com/v1/userinfo",
    emails_url: None,
    scopes: &["openid", "email", "profile"],
    attributes: AttributeMap {
        id: "sub",
        email: "email",
        email_verified: Some("email_verified"),
        name: &["name"],
        avatar: "picture",
    },
};

/// All providers this build knows how to talk to.
pub const PROVIDERS: &[ProviderSpec] = &[GITHUB, GOOGLE];

/// Look up a provider by registration id.
pub fn provider(name: &str) -> Option<&'static ProviderSpec> {
    PROVIDERS.iter().find(|p| p.name == name)
}

fn string_attr(payload: &Value, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        // GitHub ids are numbers.
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn flag_attr(payload: &Value, key: &str) -> bool {
    match payload.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

impl ProviderSpec {
    /// Map a userinfo payload to a profile. Only the subject id is mandatory here.
    pub fn extract(&self, payload: &Value) -> Result<OAuthProfile, AuthError> {
        let attrs = &self.attributes;
        let provider_id = string_attr(payload, attrs.id).ok_or_else(|| {
            AuthError::OAuth(format!("{} profile has no `{}` attribute", self.name, attrs.id))
        })?;
        let email = string_attr(payload, attrs.email)
            .filter(|_| attrs.email_verified.is_none_or(|flag| flag_attr(payload, flag)));
        Ok(OAuthProfile {
            provider: self.name.to_string(),
            provider_id,
            email,
            name: attrs.name.iter().find_map(|key| string_attr(payload, key)),
            avatar_url: string_attr(payload, attrs.avatar),
        })
    }
}

/// Pick the primary verified address from a GitHub-style `/user/emails` listing.
pub fn primary_email(listing: &Value) -> Option<String> {
    let entries = listing.as_array()?;
    let verified = |e: &&Value| e.get("verified").and_then(Value::as_bool).unwrap_or(false);
    let primary = |e: &&Value| e.get("primary").and_then(Value::as_bool).unwrap_or(false);
    entries
        .iter()
        .filter(verified)
        .find(primary)
        .or_else(|| entries.iter().find(verified))
        .and_then(|e| string_attr(e, "email"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_by_name() {
        assert_eq!(provider("github").unwrap().name, "github");
        assert_eq!(provider("google").unwrap().name, "google");
        assert!(provider("myspace").is_none());
    }

    #[test]
    fn github_profile_uses_numeric_id_and_avatar_url() {
        let profile = GITHUB
            .extract(&json!({
                "id": 583231,
                "login": "octocat",
                "name": null,
                "email": "octo@github.com",
                "avatar_url": "https://avatars.githubusercontent.com/u/583231"
            }))
            .unwrap();
        assert_eq!(profile.provider, "github");
        assert_eq!(profile.provider_id, "583231");
        assert_eq!(profile.name.as_deref(), Some("octocat"));
        assert_eq!(profile.email.as_deref(), Some("octo@github.com"));
        assert!(profile.avatar_url.unwrap().contains("583231"));
    }

    #[test]
    fn google_profile_uses_sub_and_picture() {
        let profile = GOOGLE
            .extract(&json!({
                "sub": "1100220033",
                "email": "a@x.com",
                "email_verified": true,
                "name": "Alice",
                "picture": "https://lh3.googleusercontent.com/a"
            }))
            .unwrap();
        assert_eq!(profile.provider_id, "1100220033");
        assert_eq!(profile.email.as_deref(), Some("a@x.com"));
        assert_eq!(profile.name.as_deref(), Some("Alice"));
        assert_eq!(
            profile.avatar_url.as_deref(),
            Some("https://lh3.googleusercontent.com/a")
        );
    }

    #[test]
    fn missing_subject_is_an_error() {
        let err = GOOGLE.extract(&json!({ "email": "a@x.com" })).unwrap_err();
        assert!(matches!(err, AuthError::OAuth(_)));
    }

    #[test]
    fn unverified_google_email_counts_as_absent() {
        for verified in [json!(false), json!("false"), Value::Null] {
            let profile = GOOGLE
                .extract(&json!({ "sub": "1", "email": "a@x.com", "email_verified": verified }))
                .unwrap();
            assert!(profile.email.is_none(), "email_verified = {verified}");
        }
        let missing_flag = GOOGLE.extract(&json!({ "sub": "1", "email": "a@x.com" })).unwrap();
        assert!(missing_flag.email.is_none());

        let string_flag = GOOGLE
            .extract(&json!({ "sub": "1", "email": "a@x.com", "email_verified": "true" }))
            .unwrap();
        assert_eq!(string_flag.email.as_deref(), Some("a@x.com"));
    }

    #[test]
    fn blank_email_counts_as_absent() {
        let profile = GITHUB.extract(&json!({ "id": 1, "email": "  " })).unwrap();
        assert!(profile.email.is_none());
    }

    #[test]
    fn primary_verified_email_wins() {
        let listing = json!([
            { "email": "old@x.com", "primary": false, "verified": true },
            { "email": "unverified@x.com", "primary": true, "verified": false },
            { "email": "main@x.com", "primary": true, "verified": true }
        ]);
        assert_eq!(primary_email(&listing).as_deref(), Some("main@x.com"));

        let no_primary = json!([
            { "email": "unverified@x.com", "primary": true, "verified": false },
            { "email": "old@x.com", "primary": false, "verified": true }
        ]);
        assert_eq!(primary_email(&no_primary).as_deref(), Some("old@x.com"));

        assert!(primary_email(&json!([])).is_none());
        assert!(primary_email(&json!({ "message": "Bad credentials" })).is_none());
    }
}
