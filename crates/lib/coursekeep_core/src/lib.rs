//! # coursekeep_core
//!
//! Authentication and session core for Coursekeep: password hashing, token
//! signing, refresh-token persistence and rotation, OAuth account linking and
//! auth-route rate limiting. Contains no HTTP server types.

pub mod auth;
pub mod migrate;
pub mod models;
pub mod rate_limit;
pub mod uuid;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
