use crate::{
    auth::{self, ExtractAuth, Keys, SESSION_LENGTH},
    config::Config,
    error::{AppError, AppResult},
    models::{User, UserRole},
    oauth::{GoogleAuth, GoogleUser},
    schema::*,
    DbPool,
};
use axum::{extract::Query, http::StatusCode, routing::get, Extension, Json, Router};
use diesel::{prelude::*, upsert::excluded};
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginUrlResponse {
    url: String,
}

#[derive(Deserialize)]
struct CallbackQuery {
    code: String,
    state: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UserAuthorizedResponse {
    token: String,
    user: User,
}

async fn google_login(
    Extension(google): Extension<Arc<GoogleAuth>>,
) -> AppResult<Json<LoginUrlResponse>> {
    Ok(Json(LoginUrlResponse {
        url: google.login_url().await.to_string(),
    }))
}

async fn google_callback(
    Extension(pool): Extension<DbPool>,
    Extension(google): Extension<Arc<GoogleAuth>>,
    Extension(keys): Extension<Arc<Keys>>,
    Extension(config): Extension<Arc<Config>>,
    Query(query): Query<CallbackQuery>,
) -> AppResult<Json<UserAuthorizedResponse>> {
    if !google.pending.redeem(&query.state).await {
        return Err(AppError::from(
            StatusCode::BAD_REQUEST,
            "login expired or was not started here, please try again",
        ));
    }

    let google_user = google.exchange(query.code).await?;
    if !google.accepts(&google_user) {
        return Err(AppError::forbidden(
            "this Google account is not allowed to sign in",
        ));
    }

    let is_admin = config
        .admin_emails()
        .contains(&google_user.email.to_lowercase());

    let conn = &mut pool.get().await?;
    let user = upsert_user(conn, &google_user, is_admin).await?;
    tracing::info!(user_id = user.id, "signed in");

    Ok(Json(UserAuthorizedResponse {
        token: auth::generate_jwt(&keys, &user, SESSION_LENGTH)?,
        user,
    }))
}

/// Creates the user on first sign-in and refreshes the profile afterwards.
/// Admin status is only ever granted here, never revoked.
async fn upsert_user(
    conn: &mut diesel_async::AsyncPgConnection,
    google_user: &GoogleUser,
    is_admin: bool,
) -> AppResult<User> {
    #[derive(Insertable)]
    #[diesel(table_name = users)]
    struct NewUser {
        google_id: String,
        email: String,
        name: String,
        avatar_url: Option<String>,
        role: &'static str,
    }

    let user = diesel::insert_into(users::table)
        .values(NewUser {
            google_id: google_user.sub.clone(),
            email: google_user.email.clone(),
            name: google_user.display_name(),
            avatar_url: google_user.picture.clone(),
            role: UserRole::Student.as_str(),
        })
        .on_conflict(users::google_id)
        .do_update()
        .set((
            users::email.eq(excluded(users::email)),
            users::name.eq(excluded(users::name)),
            users::avatar_url.eq(excluded(users::avatar_url)),
        ))
        .get_result::<User>(conn)
        .await?;

    if is_admin && !user.is_admin() {
        return Ok(diesel::update(users::table.find(user.id))
            .set(users::role.eq(UserRole::Admin.as_str()))
            .get_result::<User>(conn)
            .await?);
    }
    Ok(user)
}

async fn me(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
) -> AppResult<Json<User>> {
    let conn = &mut pool.get().await?;

    let user = users::table
        .find(claims.user_id)
        .first::<User>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::from(StatusCode::UNAUTHORIZED, "user no longer exists"))?;

    Ok(Json(user))
}

pub fn app() -> Router {
    Router::new()
        .route("/google", get(google_login))
        .route("/google/callback", get(google_callback))
        .route("/me", get(me))
}
