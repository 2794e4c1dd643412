//! # coursekeep_api
//!
//! HTTP API library for Coursekeep: auth routes, cookie transport, rate
//! limiting and the access-token gate for everything else.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;

use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderValue, Method, header};
use axum::routing::{get, post};
use chrono::Duration;
use coursekeep_core::auth::jwt::{Authenticator, TokenCodec};
use coursekeep_core::auth::oauth::OAuthLinker;
use coursekeep_core::auth::oauth::client::OAuthClient;
use coursekeep_core::auth::password::PasswordHasher;
use coursekeep_core::auth::session::AuthSessionService;
use coursekeep_core::auth::store::{RefreshTokenStore, UserStore};
use coursekeep_core::rate_limit::RateLimiter;
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::config::ApiConfig;
use crate::handlers::{auth, oauth};
use crate::services::cookies::SessionTransport;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    /// API configuration.
    pub config: ApiConfig,
    pub sessions: Arc<AuthSessionService>,
    /// Access-token verification for protected routes.
    pub authenticator: Arc<dyn Authenticator>,
    pub oauth: Arc<OAuthClient>,
    pub linker: Arc<OAuthLinker>,
    pub limiter: Arc<RateLimiter>,
    pub transport: SessionTransport,
}

impl AppState {
    /// Wire the auth services over the given stores.
    pub fn new(
        config: ApiConfig,
        users: Arc<dyn UserStore>,
        tokens: Arc<dyn RefreshTokenStore>,
    ) -> Self {
        let codec = TokenCodec::new(
            config.jwt_secret.as_bytes(),
            Duration::seconds(config.access_ttl_secs),
            Duration::seconds(config.refresh_ttl_secs),
        );
        let sessions = Arc::new(AuthSessionService::new(
            users,
            tokens,
            codec.clone(),
            PasswordHasher::new(config.bcrypt_cost),
        ));
        Self {
            authenticator: Arc::new(codec),
            linker: Arc::new(OAuthLinker::new(Arc::clone(&sessions))),
            oauth: Arc::new(
                OAuthClient::new(config.oauth_providers.clone())
                    .with_max_pending(config.oauth_max_pending),
            ),
            limiter: Arc::new(RateLimiter::new(config.rate_limit)),
            transport: SessionTransport::from_config(&config),
            sessions,
            config,
        }
    }
}

/// Run embedded database migrations.
///
/// Delegates to `coursekeep_core::migrate::migrate()` which owns the migration files.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    coursekeep_core::migrate::migrate(pool).await
}

fn cors(config: &ApiConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origins()
        .into_iter()
        .filter_map(|origin| match HeaderValue::from_str(&origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "skipping invalid CORS origin");
                None
            }
        })
        .collect();

    // Credentialed CORS needs explicit origins, methods and headers.
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}

/// Builds the Axum router with all routes and shared state.
pub fn router(state: AppState) -> Router {
    // Login and register share the strict bucket.
    let credentials = Router::new()
        .route(routes::POST_AUTH_REGISTER, post(auth::register_handler))
        .route(routes::POST_AUTH_LOGIN, post(auth::login_handler))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit::limit_credentials,
        ));

    let refresh = Router::new()
        .route(routes::POST_AUTH_REFRESH, post(auth::refresh_handler))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit::limit_refresh,
        ));

    // OAuth entry and callback (no auth, no rate limit)
    let oauth_routes = Router::new()
        .route(routes::GET_OAUTH_AUTHORIZE, get(oauth::authorize_handler))
        .route(routes::GET_OAUTH_CALLBACK, get(oauth::callback_handler));

    // Protected routes (require auth)
    let protected = Router::new()
        .route(routes::POST_AUTH_LOGOUT, post(auth::logout_handler))
        .route(routes::GET_AUTH_ME, get(auth::me_handler))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::require_auth,
        ));

    Router::new()
        .merge(credentials)
        .merge(refresh)
        .merge(oauth_routes)
        .merge(protected)
        .layer(cors(&state.config))
        .with_state(state)
}
