use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
    Extension,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Identity of the caller, stored in request extensions by [`jwt_middleware`].
///
/// The engine never authenticates anyone itself; it only scopes every
/// operation to `user_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: String,
    pub is_admin: bool,
}

/// Claims expected inside the JWT for authenticated users.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject - the user's identifier.
    pub sub: String,
    pub exp: usize,
    #[serde(default)]
    pub admin: bool,
}

/// HS256 signing and verification keys.
#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtKeys {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    /// Issues a token for `user_id` that expires after `ttl`.
    pub fn issue(
        &self,
        user_id: &str,
        is_admin: bool,
        ttl: Duration,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = Claims {
            sub: user_id.to_string(),
            exp: (Utc::now() + ttl).timestamp().max(0) as usize,
            admin: is_admin,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }

    pub fn verify(&self, token: &str) -> Result<AuthContext, jsonwebtoken::errors::Error> {
        let claims = decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))?
            .claims;
        Ok(AuthContext {
            user_id: claims.sub,
            is_admin: claims.admin,
        })
    }
}

/// Middleware to validate a Bearer JWT in the `Authorization` header.
///
/// On success the decoded [`AuthContext`] is attached to the request; on
/// failure a `401` is returned.
pub async fn jwt_middleware(
    State(keys): State<JwtKeys>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let auth = keys.verify(token).map_err(|e| {
        debug!(error = %e, "Rejected bearer token");
        StatusCode::UNAUTHORIZED
    })?;
    if auth.user_id.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    req.extensions_mut().insert(auth);
    Ok(next.run(req).await)
}

/// Rejects callers without the `admin` claim. Must run inside
/// [`jwt_middleware`].
pub async fn require_admin(
    Extension(auth): Extension<AuthContext>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if !auth.is_admin {
        return Err(StatusCode::FORBIDDEN);
    }
    Ok(next.run(req).await)
}
