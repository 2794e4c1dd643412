//! OAuth login handlers.
//!
//! Both endpoints answer with redirects only. Failures never surface as
//! JSON; the browser is sent back to the frontend login page with the
//! reason in `?error=`.

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Redirect, Response};
use axum_extra::extract::cookie::CookieJar;
use coursekeep_core::auth::AuthError;
use coursekeep_core::models::auth::Session;
use serde::Deserialize;
use tracing::warn;

use crate::AppState;

/// Query parameters the provider appends to the callback.
#[derive(Debug, Default, Deserialize)]
pub struct OAuthCallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Provider error codes are short identifiers such as `access_denied`.
/// Anything else is replaced so free text never reaches the redirect.
fn provider_error_code(error: &str) -> String {
    let is_code = !error.is_empty()
        && error.len() <= 64
        && error.bytes().all(|b| b.is_ascii_lowercase() || b == b'_');
    if is_code {
        error.to_string()
    } else {
        "Authentication failed".to_string()
    }
}

fn failure_redirect(state: &AppState, provider: &str, err: &AuthError) -> Response {
    warn!(provider, error = %err, "oauth login failed");
    let message = match err {
        AuthError::OAuth(msg) => msg.as_str(),
        _ => "Authentication failed",
    };
    let encoded: String = url::form_urlencoded::byte_serialize(message.as_bytes()).collect();
    Redirect::to(&format!(
        "{}/login?error={encoded}",
        state.config.frontend_url()
    ))
    .into_response()
}

/// `GET /oauth2/authorization/{provider}`: redirect to the provider.
pub async fn authorize_handler(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Response {
    let redirect_uri = state.config.oauth_redirect_uri(&provider);
    match state.oauth.authorize_url(&provider, &redirect_uri) {
        Ok(url) => Redirect::to(url.as_str()).into_response(),
        Err(e) => failure_redirect(&state, &provider, &e),
    }
}

async fn complete_login(
    state: &AppState,
    provider: &str,
    params: OAuthCallbackParams,
) -> Result<Session, AuthError> {
    if let Some(error) = params.error {
        warn!(
            provider,
            error = %error,
            description = ?params.error_description,
            "provider refused authorization"
        );
        return Err(AuthError::OAuth(provider_error_code(&error)));
    }
    let (Some(code), Some(oauth_state)) = (params.code, params.state) else {
        return Err(AuthError::OAuth("Missing authorization code or state".into()));
    };
    let profile = state.oauth.complete(provider, &code, &oauth_state).await?;
    state.linker.link(profile).await
}

/// `GET /login/oauth2/code/{provider}`: finish the flow, set cookies and
/// send the browser to the frontend.
pub async fn callback_handler(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<OAuthCallbackParams>,
    jar: CookieJar,
) -> Response {
    match complete_login(&state, &provider, params).await {
        Ok(session) => {
            let jar = state.transport.write(jar, &session.tokens);
            let target = format!("{}/oauth/callback", state.config.frontend_url());
            (jar, Redirect::to(&target)).into_response()
        }
        Err(e) => failure_redirect(&state, &provider, &e),
    }
}
