use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{request::Parts, HeaderMap},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::user::User;
use crate::orgs::Session;
use crate::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,   // user id
    pub sid: String, // session id, keys the active organization
    pub exp: i64,
    pub iat: i64,
}

/// The caller, resolved from a bearer token issued by the identity provider.
pub struct AuthUser {
    pub user: User,
    pub session: Session,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = AppState::from_ref(state);
        let token = extract_bearer_token(&parts.headers).ok_or(AppError::Unauthenticated)?;

        let key = DecodingKey::from_secret(app_state.jwt_secret.as_bytes());
        let claims = decode::<Claims>(&token, &key, &Validation::new(Algorithm::HS256))
            .map_err(|e| {
                tracing::warn!("JWT decode failed: {}", e);
                AppError::Unauthenticated
            })?
            .claims;

        // The user must still exist; profile fields are read fresh every request
        let user = app_state
            .store
            .find_user(claims.sub)
            .await?
            .ok_or(AppError::Unauthenticated)?;

        let expires_at = OffsetDateTime::from_unix_timestamp(claims.exp)
            .map_err(|_| AppError::Unauthenticated)?;

        Ok(AuthUser {
            user,
            session: Session {
                id: claims.sid,
                expires_at,
            },
        })
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let auth = headers.get("Authorization")?.to_str().ok()?;
    let token = auth.strip_prefix("Bearer ")?;
    Some(token.to_string())
}

pub fn create_token(
    user_id: Uuid,
    session_id: &str,
    secret: &str,
    expiry_hours: u64,
) -> anyhow::Result<String> {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let now = OffsetDateTime::now_utc();
    let exp = now + time::Duration::hours(expiry_hours as i64);

    let claims = Claims {
        sub: user_id,
        sid: session_id.to_string(),
        exp: exp.unix_timestamp(),
        iat: now.unix_timestamp(),
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}
