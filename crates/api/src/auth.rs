//! Session authentication.
//!
//! API sessions are HS256 JWTs issued at login (login itself lives in the
//! main product; this service only validates). `require_auth` resolves the
//! bearer token to an [`AuthUser`] carrying the caller's organization and
//! membership level, which admin-gated handlers check.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use sightline_shared::MembershipLevel;

use crate::{error::ApiError, state::AppState};

/// Claims in a Sightline session token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject (user ID)
    pub sub: Uuid,
    /// Organization the session is scoped to
    pub org_id: Uuid,
    pub email: String,
    /// Issued at
    pub iat: i64,
    /// Expiration
    pub exp: i64,
}

/// Issues and validates session tokens
#[derive(Clone)]
pub struct SessionTokenManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiry_hours: i64,
}

impl SessionTokenManager {
    pub fn new(secret: &str, expiry_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            expiry_hours,
        }
    }

    pub fn generate(&self, user_id: Uuid, org_id: Uuid, email: &str) -> Result<String, ApiError> {
        let now = OffsetDateTime::now_utc();
        let claims = SessionClaims {
            sub: user_id,
            org_id,
            email: email.to_string(),
            iat: now.unix_timestamp(),
            exp: (now + Duration::hours(self.expiry_hours)).unix_timestamp(),
        };

        // Explicit algorithm prevents algorithm confusion attacks
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|_| ApiError::Internal)
    }

    pub fn validate(&self, token: &str) -> Result<SessionClaims, ApiError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;

        decode::<SessionClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|_| ApiError::InvalidToken)
    }
}

/// Authenticated caller, inserted as a request extension by [`require_auth`]
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub email: String,
    pub distinct_id: String,
    /// Membership level in the session's organization, if any
    pub level: Option<MembershipLevel>,
}

impl AuthUser {
    /// Admin-gated endpoints require at least Admin level.
    pub fn require_admin(&self) -> Result<(), ApiError> {
        match self.level {
            Some(level) if level.can_administer() => Ok(()),
            _ => Err(ApiError::Forbidden),
        }
    }
}

fn bearer_token(request: &Request) -> Result<&str, ApiError> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)
}

/// Middleware: validate the bearer session token and attach [`AuthUser`].
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let claims = state.sessions.validate(bearer_token(&request)?)?;

    let row: Option<(String, Option<i16>)> = sqlx::query_as(
        r#"
        SELECT u.distinct_id, m.level
        FROM users u
        LEFT JOIN organization_memberships m
            ON m.user_id = u.id AND m.organization_id = $2
        WHERE u.id = $1
        "#,
    )
    .bind(claims.sub)
    .bind(claims.org_id)
    .fetch_optional(&state.pool)
    .await?;

    let (distinct_id, level) = row.ok_or(ApiError::InvalidToken)?;

    request.extensions_mut().insert(AuthUser {
        user_id: claims.sub,
        org_id: claims.org_id,
        email: claims.email,
        distinct_id,
        level: level.and_then(MembershipLevel::from_level),
    });

    Ok(next.run(request).await)
}
