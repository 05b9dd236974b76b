//! Request auth context and JWT verification.
//!
//! The context is derived fresh per request and carried explicitly through
//! the RLS, REST and RPC layers; nothing here is ambient state.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::{distributions::Alphanumeric, Rng};
use serde_json::{Map, Value};
use thiserror::Error;

/// The canonical roles. Unknown `role` claims degrade to `Anon` so a forged
/// role name never grants anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Anon,
    Authenticated,
    ServiceRole,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Anon => "anon",
            Role::Authenticated => "authenticated",
            Role::ServiceRole => "service_role",
        }
    }

    pub fn from_claim(value: &str) -> Role {
        match value {
            "service_role" => Role::ServiceRole,
            "authenticated" => Role::Authenticated,
            _ => Role::Anon,
        }
    }
}

/// Per-request auth context consumed by RLS, the REST compiler and RPC.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthContext {
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub role: Role,
    pub bypass_rls: bool,
    pub claims: Map<String, Value>,
}

impl AuthContext {
    pub fn anon() -> Self {
        Self {
            user_id: None,
            email: None,
            role: Role::Anon,
            bypass_rls: false,
            claims: Map::new(),
        }
    }

    pub fn service_role() -> Self {
        Self {
            user_id: None,
            email: None,
            role: Role::ServiceRole,
            bypass_rls: true,
            claims: Map::new(),
        }
    }

    /// A claim rendered the way `auth.jwt()->>'name'` would render it: text
    /// for strings, JSON text for anything else, None for absent claims.
    pub fn claim_text(&self, name: &str) -> Option<String> {
        let value = match name {
            "sub" => return self.user_id.clone(),
            "email" => return self.email.clone(),
            "role" => return Some(self.role.as_str().to_string()),
            other => self.claims.get(other)?,
        };
        Some(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid_token")]
    InvalidToken,
    #[error("invalid_apikey")]
    InvalidApiKey,
}

/// HS256 signing/verification keys derived from the instance secret.
#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Signs an arbitrary claim set. `exp` must be present (the verifier
    /// requires it).
    pub fn sign(&self, claims: &Value) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|_| AuthError::InvalidToken)
    }

    /// Mints the long-lived anon or service-role API key: a JWT whose `role`
    /// claim selects the identity, the same shape Supabase clients expect.
    pub fn mint_api_key(&self, role: Role) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = serde_json::json!({
            "iss": "sblite",
            "role": role.as_str(),
            "iat": now.timestamp(),
            "exp": (now + Duration::days(3650)).timestamp(),
        });
        self.sign(&claims)
    }

    /// Verifies signature and expiry, returning the raw claim map.
    pub fn verify(&self, token: &str) -> Result<Map<String, Value>, AuthError> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<Map<String, Value>>(token, &self.decoding, &validation)
            .map_err(|_| AuthError::InvalidToken)?;
        Ok(data.claims)
    }

    /// Builds the context an API key alone establishes (no user overlay).
    pub fn context_from_api_key(&self, apikey: &str) -> Result<AuthContext, AuthError> {
        let claims = self.verify(apikey).map_err(|_| AuthError::InvalidApiKey)?;
        let role = claims
            .get("role")
            .and_then(Value::as_str)
            .map(Role::from_claim)
            .unwrap_or(Role::Anon);
        let ctx = match role {
            Role::ServiceRole => AuthContext::service_role(),
            _ => AuthContext::anon(),
        };
        Ok(ctx)
    }

    /// Overlays a user JWT onto an existing context: `sub`, `email`, `role`
    /// and the remaining claims.
    pub fn overlay_bearer(&self, ctx: &mut AuthContext, token: &str) -> Result<(), AuthError> {
        let claims = self.verify(token)?;
        ctx.user_id = claims.get("sub").and_then(Value::as_str).map(String::from);
        ctx.email = claims
            .get("email")
            .and_then(Value::as_str)
            .map(String::from);
        if let Some(role) = claims.get("role").and_then(Value::as_str) {
            let role = Role::from_claim(role);
            ctx.role = role;
            ctx.bypass_rls = role == Role::ServiceRole;
        } else if ctx.user_id.is_some() {
            ctx.role = Role::Authenticated;
        }
        ctx.claims = claims;
        Ok(())
    }
}

/// A random secret for instances started without `SBLITE_JWT_SECRET`. Good
/// enough for local development; the startup log warns about it.
pub fn generate_dev_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> JwtKeys {
        JwtKeys::new("test-secret")
    }

    #[test]
    fn minted_api_keys_round_trip() {
        let keys = keys();
        let anon = keys.mint_api_key(Role::Anon).unwrap();
        let svc = keys.mint_api_key(Role::ServiceRole).unwrap();

        let ctx = keys.context_from_api_key(&anon).unwrap();
        assert_eq!(ctx.role, Role::Anon);
        assert!(!ctx.bypass_rls);

        let ctx = keys.context_from_api_key(&svc).unwrap();
        assert_eq!(ctx.role, Role::ServiceRole);
        assert!(ctx.bypass_rls);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = keys().mint_api_key(Role::Anon).unwrap();
        let other = JwtKeys::new("different");
        assert!(matches!(
            other.context_from_api_key(&token),
            Err(AuthError::InvalidApiKey)
        ));
    }

    #[test]
    fn bearer_overlay_sets_user_and_role() {
        let keys = keys();
        let token = keys
            .sign(&serde_json::json!({
                "sub": "user-1",
                "email": "u1@example.com",
                "role": "authenticated",
                "exp": (Utc::now() + Duration::hours(1)).timestamp(),
                "app_metadata": {"plan": "pro"},
            }))
            .unwrap();

        let mut ctx = AuthContext::anon();
        keys.overlay_bearer(&mut ctx, &token).unwrap();
        assert_eq!(ctx.user_id.as_deref(), Some("user-1"));
        assert_eq!(ctx.role, Role::Authenticated);
        assert_eq!(ctx.claim_text("sub").as_deref(), Some("user-1"));
        assert_eq!(
            ctx.claim_text("app_metadata").as_deref(),
            Some("{\"plan\":\"pro\"}")
        );
    }

    #[test]
    fn expired_tokens_fail_verification() {
        let keys = keys();
        let token = keys
            .sign(&serde_json::json!({
                "sub": "user-1",
                "exp": (Utc::now() - Duration::hours(1)).timestamp(),
            }))
            .unwrap();
        let mut ctx = AuthContext::anon();
        assert_eq!(
            keys.overlay_bearer(&mut ctx, &token),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn forged_role_claims_degrade_to_anon() {
        assert_eq!(Role::from_claim("superuser"), Role::Anon);
    }
}
