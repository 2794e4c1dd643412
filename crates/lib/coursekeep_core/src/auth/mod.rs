//! Authentication and session logic.
//!
//! Provides password hashing, token signing, refresh-token persistence,
//! the session state machine, and OAuth account linking. Shared by
//! `coursekeep_api` and anything else that needs a verified user id.

pub mod jwt;
pub mod memory;
pub mod oauth;
pub mod password;
pub mod queries;
pub mod session;
pub mod store;

use thiserror::Error;

/// Authentication errors.
///
/// Credential and token variants are deliberately coarse: callers must not
/// be able to tell a missing account from a wrong password, or a revoked
/// refresh token from an expired one.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Email already registered")]
    DuplicateEmail,

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Refresh token has been revoked or expired")]
    TokenRevokedOrExpired,

    #[error("Authentication required")]
    Unauthenticated,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("OAuth error: {0}")]
    OAuth(String),

    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}
