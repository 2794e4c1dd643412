//! Authentication request handlers.

use axum::extract::State;
use axum::{Extension, Json};
use axum_extra::extract::cookie::CookieJar;
use coursekeep_core::models::auth::UserView;

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthenticatedUser;
use crate::models::{AuthResponse, LoginRequest, MessageResponse, RegisterRequest};

/// `POST /api/v1/auth/register`: create a local account and sign it in.
pub async fn register_handler(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(body): Json<RegisterRequest>,
) -> AppResult<(CookieJar, Json<AuthResponse>)> {
    let session = state
        .sessions
        .register(&body.email, &body.password, &body.name)
        .await?;
    let jar = state.transport.write(jar, &session.tokens);
    Ok((jar, Json(AuthResponse::from(&session))))
}

/// `POST /api/v1/auth/login`: authenticate with email + password.
pub async fn login_handler(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(body): Json<LoginRequest>,
) -> AppResult<(CookieJar, Json<AuthResponse>)> {
    let session = state.sessions.login(&body.email, &body.password).await?;
    let jar = state.transport.write(jar, &session.tokens);
    Ok((jar, Json(AuthResponse::from(&session))))
}

/// `POST /api/v1/auth/refresh`: rotate the refresh cookie into a new pair.
pub async fn refresh_handler(
    State(state): State<AppState>,
    jar: CookieJar,
) -> AppResult<(CookieJar, Json<AuthResponse>)> {
    let token = state
        .transport
        .read_refresh(&jar)
        .ok_or_else(|| AppError::Unauthorized("Refresh token missing".into()))?;
    let session = state.sessions.refresh(&token).await?;
    let jar = state.transport.write(jar, &session.tokens);
    Ok((jar, Json(AuthResponse::from(&session))))
}

/// `POST /api/v1/auth/logout`: revoke every refresh token of the caller.
pub async fn logout_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(principal)): Extension<AuthenticatedUser>,
    jar: CookieJar,
) -> AppResult<(CookieJar, Json<MessageResponse>)> {
    state.sessions.logout(principal.user_id).await?;
    let jar = state.transport.clear(jar);
    Ok((
        jar,
        Json(MessageResponse {
            message: "Logged out successfully".into(),
        }),
    ))
}

/// `GET /api/v1/auth/me`: the calling user.
pub async fn me_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(principal)): Extension<AuthenticatedUser>,
) -> AppResult<Json<UserView>> {
    let user = state
        .sessions
        .current_user(principal.user_id)
        .await?
        .ok_or_else(|| AppError::Unauthorized("User not found".into()))?;
    Ok(Json(user.view()))
}
