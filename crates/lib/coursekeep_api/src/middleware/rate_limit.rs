//! Rate-limit gates for the credential and refresh routes.

use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use coursekeep_core::rate_limit::{RateLimitDecision, RouteClass};

use crate::AppState;
use crate::error::AppError;

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Best-effort client identity: first `X-Forwarded-For` hop when it parses
/// as an IP address, else the peer address. Spoofable unless a trusted proxy
/// overwrites the header.
pub fn client_key(request: &Request) -> String {
    let forwarded = request
        .headers()
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok());
    let peer = || {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
    };
    // Keys are always canonical addresses, so their size is bounded.
    forwarded
        .or_else(peer)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn enforce(
    state: &AppState,
    class: RouteClass,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    match state.limiter.check(class, &client_key(&request)) {
        RateLimitDecision::Allowed { .. } => Ok(next.run(request).await),
        RateLimitDecision::Limited { retry_after } => Err(AppError::RateLimited { retry_after }),
    }
}

/// Login and register.
pub async fn limit_credentials(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    enforce(&state, RouteClass::Credentials, request, next).await
}

pub async fn limit_refresh(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    enforce(&state, RouteClass::Refresh, request, next).await
}
