//! Request context extraction.

use std::convert::Infallible;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

/// Header carrying the authenticated user identifier, as populated by an
/// authenticating reverse proxy.
const USER_HEADER: &str = "x-forwarded-user";

/// The per-request context relevant to the gateway.
///
/// Tokens are treated as opaque bearer strings and forwarded as given; the
/// user identifier is whatever the authentication layer in front of the
/// gateway asserted. Neither is validated here.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// The asserted identity of the requester, if any.
    pub user_id: Option<String>,
    /// The bearer token carried by the request, if any.
    pub token: Option<String>,
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| {
                value
                    .strip_prefix("Bearer ")
                    .or_else(|| value.strip_prefix("bearer "))
            })
            .filter(|token| !token.is_empty())
            .map(str::to_string);

        let user_id = parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|user| !user.is_empty())
            .map(str::to_string);

        Ok(Self { user_id, token })
    }
}
