use super::{clean, ReviewRequest};
use crate::{
    auth::AdminOnly,
    config::Config,
    email::Email,
    error::{AppError, AppResult},
    models::{
        Club, ClubRole, ClubStatus, NotificationKind, Report, ReportStatus, User, UserRole,
    },
    notify::{Notifier, Outgoing},
    schema::*,
    DbPool,
};
use axum::{
    extract::{Path, Query},
    routing::{get, post, put},
    Extension, Json, Router,
};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Deserialize)]
struct ReportQuery {
    status: Option<ReportStatus>,
}

#[derive(Deserialize)]
struct RoleRequest {
    role: UserRole,
}

async fn pending_clubs(
    AdminOnly(_): AdminOnly,
    Extension(pool): Extension<DbPool>,
) -> AppResult<Json<Vec<Club>>> {
    let conn = &mut pool.get().await?;

    let clubs = clubs::table
        .filter(clubs::status.eq(ClubStatus::Pending.as_str()))
        .order(clubs::created_at.asc())
        .load::<Club>(conn)
        .await?;

    Ok(Json(clubs))
}

/// Moves a pending club to `next`; a club that is no longer pending is a conflict.
async fn review_club(
    conn: &mut AsyncPgConnection,
    club_id: i32,
    next: ClubStatus,
    reason: Option<String>,
) -> AppResult<Club> {
    let exists = clubs::table
        .find(club_id)
        .select(clubs::id)
        .first::<i32>(conn)
        .await
        .optional()?;
    if exists.is_none() {
        return Err(AppError::not_found("the club does not exist"));
    }

    diesel::update(
        clubs::table
            .find(club_id)
            .filter(clubs::status.eq(ClubStatus::Pending.as_str())),
    )
    .set((
        clubs::status.eq(next.as_str()),
        clubs::rejection_reason.eq(reason),
    ))
    .get_result::<Club>(conn)
    .await
    .optional()?
    .ok_or_else(|| AppError::conflict("only pending clubs can be reviewed"))
}

async fn club_leaders(conn: &mut AsyncPgConnection, club_id: i32) -> AppResult<Vec<User>> {
    Ok(users::table
        .inner_join(club_members::table)
        .filter(club_members::club_id.eq(club_id))
        .filter(club_members::role.eq(ClubRole::Leader.as_str()))
        .select(users::all_columns)
        .load::<User>(conn)
        .await?)
}

async fn approve_club(
    AdminOnly(claims): AdminOnly,
    Extension(pool): Extension<DbPool>,
    Extension(notifier): Extension<Arc<Notifier>>,
    Extension(config): Extension<Arc<Config>>,
    Path(club_id): Path<i32>,
) -> AppResult<Json<Club>> {
    let conn = &mut pool.get().await?;

    let club = review_club(conn, club_id, ClubStatus::Approved, None).await?;
    tracing::info!(club_id, by = claims.user_id, "club approved");

    let link = config.frontend_link(&format!("/clubs/{club_id}"));
    for leader in club_leaders(conn, club_id).await? {
        notifier.dispatch(
            vec![leader.id],
            Outgoing::new(
                NotificationKind::ClubApproved,
                format!("{} was approved", club.name),
                "Your club is now listed and open to join requests.",
            )
            .link(format!("/clubs/{club_id}"))
            .email(Email::club_approved(&leader.name, &club.name, &link)),
        );
    }

    Ok(Json(club))
}

async fn reject_club(
    AdminOnly(claims): AdminOnly,
    Extension(pool): Extension<DbPool>,
    Extension(notifier): Extension<Arc<Notifier>>,
    Path(club_id): Path<i32>,
    body: Option<Json<ReviewRequest>>,
) -> AppResult<Json<Club>> {
    let reason = body.and_then(|Json(b)| clean(b.reason));

    let conn = &mut pool.get().await?;

    let club = review_club(conn, club_id, ClubStatus::Rejected, reason.clone()).await?;
    tracing::info!(club_id, by = claims.user_id, "club rejected");

    let body = match &reason {
        Some(reason) => format!("Reason: {reason}"),
        None => "No reason was given.".to_string(),
    };
    for leader in club_leaders(conn, club_id).await? {
        notifier.dispatch(
            vec![leader.id],
            Outgoing::new(
                NotificationKind::ClubRejected,
                format!("{} was not approved", club.name),
                body.clone(),
            )
            .link(format!("/clubs/{club_id}"))
            .email(Email::club_rejected(
                &leader.name,
                &club.name,
                reason.as_deref(),
            )),
        );
    }

    Ok(Json(club))
}

async fn list_reports(
    AdminOnly(_): AdminOnly,
    Extension(pool): Extension<DbPool>,
    Query(query): Query<ReportQuery>,
) -> AppResult<Json<Vec<Report>>> {
    let conn = &mut pool.get().await?;

    let mut q = reports::table.into_boxed();
    if let Some(status) = query.status {
        q = q.filter(reports::status.eq(status.as_str()));
    }
    let reports = q
        .order((reports::created_at.desc(), reports::id.desc()))
        .load::<Report>(conn)
        .await?;

    Ok(Json(reports))
}

async fn close_report(pool: DbPool, id: i32, resolve: bool) -> AppResult<Json<Report>> {
    let conn = &mut pool.get().await?;

    let report = reports::table
        .find(id)
        .first::<Report>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::not_found("the report does not exist"))?;
    let next = report
        .status
        .parse::<ReportStatus>()?
        .close(resolve)
        .ok_or_else(|| AppError::conflict("the report is already closed"))?;

    let report = diesel::update(
        reports::table
            .find(id)
            .filter(reports::status.eq(ReportStatus::Open.as_str())),
    )
    .set(reports::status.eq(next.as_str()))
    .get_result::<Report>(conn)
    .await
    .optional()?
    .ok_or_else(|| AppError::conflict("the report is already closed"))?;

    Ok(Json(report))
}

async fn resolve_report(
    AdminOnly(_): AdminOnly,
    Extension(pool): Extension<DbPool>,
    Path(id): Path<i32>,
) -> AppResult<Json<Report>> {
    close_report(pool, id, true).await
}

async fn dismiss_report(
    AdminOnly(_): AdminOnly,
    Extension(pool): Extension<DbPool>,
    Path(id): Path<i32>,
) -> AppResult<Json<Report>> {
    close_report(pool, id, false).await
}

async fn list_users(
    AdminOnly(_): AdminOnly,
    Extension(pool): Extension<DbPool>,
) -> AppResult<Json<Vec<User>>> {
    let conn = &mut pool.get().await?;

    let users = users::table
        .order(users::name.asc())
        .load::<User>(conn)
        .await?;

    Ok(Json(users))
}

async fn set_role(
    AdminOnly(claims): AdminOnly,
    Extension(pool): Extension<DbPool>,
    Path(user_id): Path<i32>,
    Json(req): Json<RoleRequest>,
) -> AppResult<Json<User>> {
    if user_id == claims.user_id && req.role != UserRole::Admin {
        return Err(AppError::bad_request("you cannot remove your own admin role"));
    }

    let conn = &mut pool.get().await?;

    let user = diesel::update(users::table.find(user_id))
        .set(users::role.eq(req.role.as_str()))
        .get_result::<User>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::not_found("the user does not exist"))?;
    tracing::info!(user_id, role = %req.role, by = claims.user_id, "site role changed");

    Ok(Json(user))
}

pub fn app() -> Router {
    Router::new()
        .route("/clubs/pending", get(pending_clubs))
        .route("/club/:id/approve", post(approve_club))
        .route("/club/:id/reject", post(reject_club))
        .route("/reports", get(list_reports))
        .route("/report/:id/resolve", post(resolve_report))
        .route("/report/:id/dismiss", post(dismiss_report))
        .route("/users", get(list_users))
        .route("/user/:id/role", put(set_role))
}
