//! Per-request auth context extraction (the `apikey` header/query plus the
//! `Authorization: Bearer` overlay).

use axum::http::HeaderMap;
use sblite_db::{AuthContext, AuthError, JwtKeys, Role};

/// The instance's signing keys plus the two canonical API keys minted from
/// them at startup.
#[derive(Clone)]
pub struct AuthKeys {
    pub jwt: JwtKeys,
    pub anon_key: String,
    pub service_key: String,
}

impl AuthKeys {
    pub fn new(secret: &str) -> Result<Self, AuthError> {
        let jwt = JwtKeys::new(secret);
        let anon_key = jwt.mint_api_key(Role::Anon)?;
        let service_key = jwt.mint_api_key(Role::ServiceRole)?;
        Ok(Self {
            jwt,
            anon_key,
            service_key,
        })
    }
}

/// Builds the request context. The apikey (header, or `query_apikey` for the
/// WebSocket upgrade) establishes the base identity; a Bearer JWT overlays
/// user claims. Failures never reveal anything about stored data.
pub fn extract_context(
    keys: &AuthKeys,
    headers: &HeaderMap,
    query_apikey: Option<&str>,
) -> Result<AuthContext, AuthError> {
    let apikey = headers
        .get("apikey")
        .and_then(|v| v.to_str().ok())
        .or(query_apikey)
        .ok_or(AuthError::InvalidApiKey)?;

    let mut ctx = if apikey == keys.service_key {
        AuthContext::service_role()
    } else if apikey == keys.anon_key {
        AuthContext::anon()
    } else {
        // Keys minted elsewhere (or by a previous run) still verify as JWTs
        // signed with the instance secret.
        keys.jwt.context_from_api_key(apikey)?
    };

    if let Some(bearer) = bearer_token(headers) {
        // The service key doubling as a bearer is common with Supabase
        // clients; it must not downgrade the context.
        if bearer != apikey {
            keys.jwt.overlay_bearer(&mut ctx, bearer)?;
        }
    }
    Ok(ctx)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
