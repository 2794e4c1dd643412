//! OAuth login: provider client and local account linking.

pub mod client;
pub mod providers;

use std::sync::Arc;

use tracing::info;

use super::AuthError;
use super::session::{AuthSessionService, normalize_email};
use crate::models::auth::{NewUser, Session, User};

/// Provider-neutral profile produced by [`providers::ProviderSpec::extract`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthProfile {
    pub provider: String,
    pub provider_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Finds or creates the local user behind an OAuth profile and signs it in.
///
/// Accounts are matched by email, so a `local` account and an OAuth login
/// with the same address resolve to one user.
pub struct OAuthLinker {
    sessions: Arc<AuthSessionService>,
}

impl OAuthLinker {
    pub fn new(sessions: Arc<AuthSessionService>) -> Self {
        Self { sessions }
    }

    pub async fn link(&self, profile: OAuthProfile) -> Result<Session, AuthError> {
        let user = self.find_or_create(profile).await?;
        info!(user_id = %user.id, provider = %user.provider, "oauth login");
        self.sessions.issue_session(&user).await
    }

    async fn find_or_create(&self, profile: OAuthProfile) -> Result<User, AuthError> {
        let email = profile
            .email
            .as_deref()
            .map(normalize_email)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| {
                AuthError::OAuth(format!("{} did not provide an email address", profile.provider))
            })?;
        let users = self.sessions.users();

        if let Some(mut user) = users.find_by_email(&email).await? {
            if user.avatar_url.is_none()
                && let Some(avatar) = profile.avatar_url
            {
                users.set_avatar(user.id, &avatar).await?;
                user.avatar_url = Some(avatar);
            }
            return Ok(user);
        }

        let name = profile.name.unwrap_or_else(|| {
            email
                .split('@')
                .next()
                .filter(|local| !local.is_empty())
                .unwrap_or("User")
                .to_string()
        });
        let created = users
            .create(NewUser {
                email: email.clone(),
                password_hash: None,
                name,
                avatar_url: profile.avatar_url,
                provider: profile.provider,
                provider_id: Some(profile.provider_id),
            })
            .await;

        match created {
            Ok(user) => Ok(user),
            // Lost a race with a concurrent first login for the same address.
            Err(AuthError::DuplicateEmail) => users
                .find_by_email(&email)
                .await?
                .ok_or(AuthError::DuplicateEmail),
            Err(e) => Err(e),
        }
    }
}
