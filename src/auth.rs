use crate::{
    error::{AppError, AppResult},
    models::{User, UserRole},
    schema::users,
    DbPool,
};
use axum::{
    async_trait,
    extract::{FromRequest, Query, RequestParts},
    headers::{authorization::Bearer, Authorization},
    http::StatusCode,
    TypedHeader,
};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use jsonwebtoken::{
    errors::Result as JwtResult, DecodingKey, EncodingKey, Header, TokenData, Validation,
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};

// one week
pub const SESSION_LENGTH: Duration = Duration::from_secs(60 * 60 * 24 * 7);

pub struct Keys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl Keys {
    pub fn from_base64_secret(secret: &str) -> JwtResult<Arc<Keys>> {
        Ok(Arc::new(Keys {
            encoding: EncodingKey::from_base64_secret(secret)?,
            decoding: DecodingKey::from_base64_secret(secret)?,
        }))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i32,
    pub role: UserRole,
    pub exp: u64,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

pub fn generate_jwt(keys: &Keys, user: &User, exp: Duration) -> anyhow::Result<String> {
    Ok(jsonwebtoken::encode(
        &Header::default(),
        &Claims {
            user_id: user.id,
            role: user.role.parse()?,
            exp: jsonwebtoken::get_current_timestamp() + exp.as_secs(),
        },
        &keys.encoding,
    )?)
}

pub fn validate_jwt(keys: &Keys, token: &str) -> JwtResult<TokenData<Claims>> {
    jsonwebtoken::decode::<Claims>(token, &keys.decoding, &Validation::default())
}

/// Any signed-in user, read from the `Authorization: Bearer` header.
pub struct ExtractAuth(pub Claims);

#[async_trait]
impl<B: Send> FromRequest<B> for ExtractAuth {
    type Rejection = AppError;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request(req)
                .await
                .map_err(|_| AppError::from(StatusCode::UNAUTHORIZED, "missing bearer token"))?;
        let keys = keys(req)?;

        claims_from_token(&keys, bearer.token()).map(ExtractAuth)
    }
}

/// Signed-in user from a `?token=` query parameter, for websocket upgrades
/// where browsers cannot set headers.
pub struct QueryAuth(pub Claims);

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

#[async_trait]
impl<B: Send> FromRequest<B> for QueryAuth {
    type Rejection = AppError;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let Query(query) = Query::<TokenQuery>::from_request(req)
            .await
            .map_err(|_| AppError::from(StatusCode::UNAUTHORIZED, "missing token"))?;
        let keys = keys(req)?;

        claims_from_token(&keys, &query.token).map(QueryAuth)
    }
}

/// Site administrators only. The token must claim ADMIN and the account must
/// still hold ADMIN in the database, so a demotion applies to tokens already
/// issued.
pub struct AdminOnly(pub Claims);

#[async_trait]
impl<B: Send> FromRequest<B> for AdminOnly {
    type Rejection = AppError;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let ExtractAuth(claims) = ExtractAuth::from_request(req).await?;
        if !claims.is_admin() {
            return Err(AppError::forbidden("administrator access required"));
        }

        let pool = req
            .extensions()
            .get::<DbPool>()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("database pool is not installed"))?;
        let conn = &mut pool.get().await?;
        require_admin(conn, claims.user_id).await?;

        Ok(AdminOnly(claims))
    }
}

/// The site role stored for the user, which wins over whatever a token says.
async fn stored_role(conn: &mut AsyncPgConnection, user_id: i32) -> AppResult<UserRole> {
    Ok(users::table
        .find(user_id)
        .select(users::role)
        .first::<String>(conn)
        .await
        .optional()?
        .ok_or_else(|| {
            AppError::from(StatusCode::UNAUTHORIZED, "the account no longer exists")
        })?
        .parse::<UserRole>()?)
}

pub async fn require_admin(conn: &mut AsyncPgConnection, user_id: i32) -> AppResult<()> {
    match stored_role(conn, user_id).await? {
        UserRole::Admin => Ok(()),
        UserRole::Student => Err(AppError::forbidden("administrator access required")),
    }
}

/// Whether the caller is a site admin right now. Tokens that never claimed
/// ADMIN are answered without a query.
pub async fn is_site_admin(conn: &mut AsyncPgConnection, claims: &Claims) -> AppResult<bool> {
    if !claims.is_admin() {
        return Ok(false);
    }
    Ok(stored_role(conn, claims.user_id).await? == UserRole::Admin)
}

fn keys<B>(req: &RequestParts<B>) -> Result<Arc<Keys>, AppError> {
    Ok(req
        .extensions()
        .get::<Arc<Keys>>()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("token keys are not installed"))?)
}

fn claims_from_token(keys: &Keys, token: &str) -> Result<Claims, AppError> {
    validate_jwt(keys, token)
        .map(|data| data.claims)
        .map_err(|e| {
            tracing::debug!("rejected token: {e}");
            AppError::from(StatusCode::UNAUTHORIZED, "invalid or expired token")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_db;
    use chrono::NaiveDateTime;

    fn test_keys() -> Arc<Keys> {
        // "a test secret that is long enough"
        Keys::from_base64_secret("YSB0ZXN0IHNlY3JldCB0aGF0IGlzIGxvbmcgZW5vdWdo").unwrap()
    }

    fn user(role: UserRole) -> User {
        User {
            id: 7,
            google_id: "g-7".to_string(),
            email: "ada@uni.edu".to_string(),
            name: "Ada".to_string(),
            avatar_url: None,
            role: role.as_str().to_string(),
            created_at: NaiveDateTime::default(),
        }
    }

    #[test]
    fn issued_tokens_validate() {
        let keys = test_keys();
        let token = generate_jwt(&keys, &user(UserRole::Admin), SESSION_LENGTH).unwrap();
        let claims = validate_jwt(&keys, &token).unwrap().claims;
        assert_eq!(claims.user_id, 7);
        assert!(claims.is_admin());
    }

    #[test]
    fn tokens_from_other_secrets_are_rejected() {
        let token = generate_jwt(&test_keys(), &user(UserRole::Student), SESSION_LENGTH).unwrap();
        let other = Keys::from_base64_secret("b3RoZXIgc2VjcmV0").unwrap();
        assert!(claims_from_token(&other, &token).is_err());
    }

    #[tokio::test]
    async fn demoted_admins_lose_access() {
        let Some(mut conn) = test_db::connect().await else {
            return;
        };
        let conn = &mut conn;

        let admin = test_db::user(conn, UserRole::Admin).await;
        require_admin(conn, admin.id).await.unwrap();

        // the token minted while they were admin still says ADMIN
        let keys = test_keys();
        let token = generate_jwt(&keys, &admin, SESSION_LENGTH).unwrap();
        assert!(validate_jwt(&keys, &token).unwrap().claims.is_admin());

        diesel::update(users::table.find(admin.id))
            .set(users::role.eq(UserRole::Student.as_str()))
            .execute(conn)
            .await
            .unwrap();
        let err = require_admin(conn, admin.id).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);

        // club-level admin overrides follow the stored role too
        let stale = validate_jwt(&keys, &token).unwrap().claims;
        assert!(!is_site_admin(conn, &stale).await.unwrap());
    }

    #[tokio::test]
    async fn deleted_accounts_are_unauthorized() {
        let Some(mut conn) = test_db::connect().await else {
            return;
        };
        let conn = &mut conn;

        let admin = test_db::user(conn, UserRole::Admin).await;
        diesel::delete(users::table.find(admin.id))
            .execute(conn)
            .await
            .unwrap();
        let err = require_admin(conn, admin.id).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let keys = test_keys();
        let claims = Claims {
            user_id: 1,
            role: UserRole::Student,
            // well past the default leeway
            exp: jsonwebtoken::get_current_timestamp() - 3600,
        };
        let token = jsonwebtoken::encode(&Header::default(), &claims, &keys.encoding).unwrap();
        let err = claims_from_token(&keys, &token).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }
}
