//! Route paths.

pub const POST_AUTH_REGISTER: &str = "/api/v1/auth/register";
pub const POST_AUTH_LOGIN: &str = "/api/v1/auth/login";
pub const POST_AUTH_REFRESH: &str = "/api/v1/auth/refresh";
pub const POST_AUTH_LOGOUT: &str = "/api/v1/auth/logout";
pub const GET_AUTH_ME: &str = "/api/v1/auth/me";

/// Starts an OAuth login; `{provider}` is a registration id such as `github`.
pub const GET_OAUTH_AUTHORIZE: &str = "/oauth2/authorization/{provider}";
/// Provider redirect target.
pub const GET_OAUTH_CALLBACK: &str = "/login/oauth2/code/{provider}";

/// Concrete callback path for a provider, as registered with that provider.
pub fn oauth_callback_path(provider: &str) -> String {
    GET_OAUTH_CALLBACK.replace("{provider}", provider)
}
