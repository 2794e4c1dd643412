//! Request-independent services used by handlers and middleware.

pub mod cookies;
