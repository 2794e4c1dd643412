//! Authentication middleware: access-token extraction and verification.

use axum::http::header::AUTHORIZATION;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use coursekeep_core::models::auth::Principal;

use crate::AppState;
use crate::error::AppError;

/// Key used to store the verified [`Principal`] in request extensions.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub Principal);

/// Access token from the `access_token` cookie, else `Authorization: Bearer`.
fn access_token(state: &AppState, request: &Request) -> Option<String> {
    let jar = CookieJar::from_headers(request.headers());
    state.transport.read_access(&jar).or_else(|| {
        request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
    })
}

/// Axum middleware: verifies the access token and injects
/// `AuthenticatedUser` into request extensions. No store lookup.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = access_token(&state, &request)
        .ok_or_else(|| AppError::Unauthorized("Authentication required".into()))?;

    let principal = state.authenticator.verify_access(&token)?;
    request.extensions_mut().insert(AuthenticatedUser(principal));

    Ok(next.run(request).await)
}
