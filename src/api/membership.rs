use super::{clean, ReviewRequest};
use crate::{
    access::{self, keeps_a_leader},
    auth::{Claims, ExtractAuth},
    config::Config,
    email::Email,
    error::{on_unique_violation, AppError, AppResult},
    models::{
        ClubRole, JoinRequest, LeaveRequest, NotificationKind, RequestStatus, User,
    },
    notify::{Notifier, Outgoing},
    schema::*,
    DbPool,
};
use axum::{
    extract::Path,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use scoped_futures::ScopedFutureExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Deserialize)]
struct JoinBody {
    message: Option<String>,
}

#[derive(Deserialize)]
struct LeaveBody {
    reason: Option<String>,
}

async fn pending_join(
    conn: &mut AsyncPgConnection,
    club_id: i32,
    user_id: i32,
) -> AppResult<Option<JoinRequest>> {
    Ok(join_requests::table
        .filter(join_requests::club_id.eq(club_id))
        .filter(join_requests::user_id.eq(user_id))
        .filter(join_requests::status.eq(RequestStatus::Pending.as_str()))
        .first::<JoinRequest>(conn)
        .await
        .optional()?)
}

async fn pending_leave(
    conn: &mut AsyncPgConnection,
    club_id: i32,
    user_id: i32,
) -> AppResult<Option<LeaveRequest>> {
    Ok(leave_requests::table
        .filter(leave_requests::club_id.eq(club_id))
        .filter(leave_requests::user_id.eq(user_id))
        .filter(leave_requests::status.eq(RequestStatus::Pending.as_str()))
        .first::<LeaveRequest>(conn)
        .await
        .optional()?)
}

async fn insert_join_request(
    conn: &mut AsyncPgConnection,
    club_id: i32,
    user_id: i32,
    message: Option<String>,
) -> AppResult<JoinRequest> {
    #[derive(Insertable)]
    #[diesel(table_name = join_requests)]
    struct NewJoinRequest {
        club_id: i32,
        user_id: i32,
        message: Option<String>,
    }

    diesel::insert_into(join_requests::table)
        .values(NewJoinRequest {
            club_id,
            user_id,
            message,
        })
        .get_result::<JoinRequest>(conn)
        .await
        .map_err(on_unique_violation("you already have a pending join request"))
}

async fn insert_leave_request(
    conn: &mut AsyncPgConnection,
    club_id: i32,
    user_id: i32,
    reason: Option<String>,
) -> AppResult<LeaveRequest> {
    #[derive(Insertable)]
    #[diesel(table_name = leave_requests)]
    struct NewLeaveRequest {
        club_id: i32,
        user_id: i32,
        reason: Option<String>,
    }

    diesel::insert_into(leave_requests::table)
        .values(NewLeaveRequest {
            club_id,
            user_id,
            reason,
        })
        .get_result::<LeaveRequest>(conn)
        .await
        .map_err(on_unique_violation("you already have a pending leave request"))
}

async fn request_join(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Extension(notifier): Extension<Arc<Notifier>>,
    Path(club_id): Path<i32>,
    body: Option<Json<JoinBody>>,
) -> AppResult<Json<JoinRequest>> {
    let conn = &mut pool.get().await?;

    let club = access::find_club(conn, club_id).await?;
    access::require_approved(&club)?;
    if access::membership(conn, club_id, claims.user_id).await?.is_some() {
        return Err(AppError::conflict("you are already a member of this club"));
    }
    if pending_join(conn, club_id, claims.user_id).await?.is_some() {
        return Err(AppError::conflict("you already have a pending join request"));
    }

    let message = body.and_then(|Json(b)| clean(b.message));
    let request = insert_join_request(conn, club_id, claims.user_id, message).await?;

    notifier.dispatch(
        access::officer_ids(conn, club_id).await?,
        Outgoing::new(
            NotificationKind::JoinRequested,
            format!("New join request for {}", club.name),
            "A student asked to join your club.",
        )
        .link(format!("/clubs/{club_id}/requests")),
    );

    Ok(Json(request))
}

async fn request_leave(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Extension(notifier): Extension<Arc<Notifier>>,
    Path(club_id): Path<i32>,
    body: Option<Json<LeaveBody>>,
) -> AppResult<Json<LeaveRequest>> {
    let conn = &mut pool.get().await?;

    let club = access::find_club(conn, club_id).await?;
    let member = access::membership(conn, club_id, claims.user_id)
        .await?
        .ok_or_else(|| AppError::bad_request("you are not a member of this club"))?;
    if !keeps_a_leader(member.role()?, access::leader_count(conn, club_id).await?) {
        return Err(AppError::conflict(
            "hand leadership to another member before leaving",
        ));
    }
    if pending_leave(conn, club_id, claims.user_id).await?.is_some() {
        return Err(AppError::conflict("you already have a pending leave request"));
    }

    let reason = body.and_then(|Json(b)| clean(b.reason));
    let request = insert_leave_request(conn, club_id, claims.user_id, reason).await?;

    notifier.dispatch(
        access::officer_ids(conn, club_id).await?,
        Outgoing::new(
            NotificationKind::LeaveRequested,
            format!("New leave request for {}", club.name),
            "A member asked to leave your club.",
        )
        .link(format!("/clubs/{club_id}/requests")),
    );

    Ok(Json(request))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestWithUser<R> {
    #[serde(flatten)]
    request: R,
    user_name: String,
    user_email: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PendingRequestsResponse {
    join: Vec<RequestWithUser<JoinRequest>>,
    leave: Vec<RequestWithUser<LeaveRequest>>,
}

async fn list_requests(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Path(club_id): Path<i32>,
) -> AppResult<Json<PendingRequestsResponse>> {
    let conn = &mut pool.get().await?;

    access::find_club(conn, club_id).await?;
    access::require_role(conn, &claims, club_id, ClubRole::Officer).await?;

    let join = join_requests::table
        .inner_join(users::table.on(users::id.eq(join_requests::user_id)))
        .filter(join_requests::club_id.eq(club_id))
        .filter(join_requests::status.eq(RequestStatus::Pending.as_str()))
        .order(join_requests::created_at.asc())
        .load::<(JoinRequest, User)>(conn)
        .await?;
    let leave = leave_requests::table
        .inner_join(users::table.on(users::id.eq(leave_requests::user_id)))
        .filter(leave_requests::club_id.eq(club_id))
        .filter(leave_requests::status.eq(RequestStatus::Pending.as_str()))
        .order(leave_requests::created_at.asc())
        .load::<(LeaveRequest, User)>(conn)
        .await?;

    fn with_user<R>((request, user): (R, User)) -> RequestWithUser<R> {
        RequestWithUser {
            request,
            user_name: user.name,
            user_email: user.email,
        }
    }

    Ok(Json(PendingRequestsResponse {
        join: join.into_iter().map(with_user).collect(),
        leave: leave.into_iter().map(with_user).collect(),
    }))
}

/// Loads a request's club and checks the reviewer may act on it.
async fn authorize_review(
    conn: &mut AsyncPgConnection,
    claims: &Claims,
    club_id: i32,
    status: &str,
) -> AppResult<(crate::models::Club, RequestStatus)> {
    let club = access::find_club(conn, club_id).await?;
    access::require_role(conn, claims, club_id, ClubRole::Officer).await?;
    let status: RequestStatus = status.parse()?;
    Ok((club, status))
}

/// Moves a pending join request to `next` and, when approved, adds the
/// requester as a MEMBER, all in one transaction.
async fn apply_join_review(
    conn: &mut AsyncPgConnection,
    request: &JoinRequest,
    next: RequestStatus,
    reviewer: i32,
) -> AppResult<JoinRequest> {
    #[derive(Insertable)]
    #[diesel(table_name = club_members)]
    struct NewMember {
        club_id: i32,
        user_id: i32,
        role: &'static str,
    }

    let (request_id, club_id, user_id) = (request.id, request.club_id, request.user_id);
    conn.transaction::<_, AppError, _>(|conn| {
        async move {
            // the status guard makes concurrent reviews lose cleanly
            let reviewed = diesel::update(
                join_requests::table
                    .find(request_id)
                    .filter(join_requests::status.eq(RequestStatus::Pending.as_str())),
            )
            .set((
                join_requests::status.eq(next.as_str()),
                join_requests::reviewed_by.eq(reviewer),
                join_requests::reviewed_at.eq(Utc::now().naive_utc()),
            ))
            .get_result::<JoinRequest>(conn)
            .await
            .optional()?
            .ok_or_else(|| AppError::conflict("the request was already reviewed"))?;

            if next == RequestStatus::Approved {
                diesel::insert_into(club_members::table)
                    .values(NewMember {
                        club_id,
                        user_id,
                        role: ClubRole::Member.as_str(),
                    })
                    .on_conflict((club_members::club_id, club_members::user_id))
                    .do_nothing()
                    .execute(conn)
                    .await?;
            }
            Ok(reviewed)
        }
        .scope_boxed()
    })
    .await
}

/// Moves a pending leave request to `next` and, when approved, removes the
/// membership. The club's leader rows stay locked while the last-leader rule
/// is checked.
async fn apply_leave_review(
    conn: &mut AsyncPgConnection,
    request: &LeaveRequest,
    next: RequestStatus,
    reviewer: i32,
) -> AppResult<LeaveRequest> {
    let (request_id, club_id, user_id) = (request.id, request.club_id, request.user_id);
    conn.transaction::<_, AppError, _>(|conn| {
        async move {
            let leaders = access::lock_leaders(conn, club_id).await?;

            let reviewed = diesel::update(
                leave_requests::table
                    .find(request_id)
                    .filter(leave_requests::status.eq(RequestStatus::Pending.as_str())),
            )
            .set((
                leave_requests::status.eq(next.as_str()),
                leave_requests::reviewed_by.eq(reviewer),
                leave_requests::reviewed_at.eq(Utc::now().naive_utc()),
            ))
            .get_result::<LeaveRequest>(conn)
            .await
            .optional()?
            .ok_or_else(|| AppError::conflict("the request was already reviewed"))?;

            if next == RequestStatus::Approved {
                if let Some(member) = access::membership(conn, club_id, user_id).await? {
                    if !keeps_a_leader(member.role()?, leaders) {
                        return Err(AppError::conflict("the club's only leader cannot leave"));
                    }
                    diesel::delete(club_members::table.find(member.id))
                        .execute(conn)
                        .await?;
                }
            }
            Ok(reviewed)
        }
        .scope_boxed()
    })
    .await
}

async fn review_join(
    claims: Claims,
    pool: DbPool,
    notifier: Arc<Notifier>,
    config: Arc<Config>,
    request_id: i32,
    approve: bool,
) -> AppResult<Json<JoinRequest>> {
    let conn = &mut pool.get().await?;

    let request = join_requests::table
        .find(request_id)
        .first::<JoinRequest>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::not_found("the join request does not exist"))?;
    let (club, status) = authorize_review(conn, &claims, request.club_id, &request.status).await?;
    let next = status
        .review(approve)
        .ok_or_else(|| AppError::conflict("the request was already reviewed"))?;

    let reviewer = claims.user_id;
    let reviewed = apply_join_review(conn, &request, next, reviewer).await?;
    tracing::info!(
        request_id,
        club_id = club.id,
        status = %next,
        by = reviewer,
        "join request reviewed"
    );

    let approved = next == RequestStatus::Approved;
    let link = config.frontend_link(&format!("/clubs/{}", club.id));
    let requester = users::table
        .find(reviewed.user_id)
        .first::<User>(conn)
        .await?;
    notifier.dispatch(
        vec![reviewed.user_id],
        Outgoing::new(
            NotificationKind::JoinReviewed,
            if approved {
                format!("Welcome to {}", club.name)
            } else {
                format!("Join request for {} declined", club.name)
            },
            if approved {
                "Your join request was approved."
            } else {
                "Your join request was declined."
            },
        )
        .link(format!("/clubs/{}", club.id))
        .email(Email::join_reviewed(&requester.name, &club.name, approved, &link)),
    );

    Ok(Json(reviewed))
}

async fn review_leave(
    claims: Claims,
    pool: DbPool,
    notifier: Arc<Notifier>,
    request_id: i32,
    approve: bool,
    reason: Option<String>,
) -> AppResult<Json<LeaveRequest>> {
    let conn = &mut pool.get().await?;

    let request = leave_requests::table
        .find(request_id)
        .first::<LeaveRequest>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::not_found("the leave request does not exist"))?;
    let (club, status) = authorize_review(conn, &claims, request.club_id, &request.status).await?;
    let next = status
        .review(approve)
        .ok_or_else(|| AppError::conflict("the request was already reviewed"))?;

    let reviewer = claims.user_id;
    let reviewed = apply_leave_review(conn, &request, next, reviewer).await?;
    tracing::info!(
        request_id,
        club_id = club.id,
        status = %next,
        by = reviewer,
        "leave request reviewed"
    );

    notifier.dispatch(
        vec![reviewed.user_id],
        Outgoing::new(
            NotificationKind::LeaveReviewed,
            format!("Leave request for {}", club.name),
            leave_outcome(next, &club.name, reason.as_deref()),
        ),
    );

    Ok(Json(reviewed))
}

fn leave_outcome(next: RequestStatus, club: &str, reason: Option<&str>) -> String {
    match (next, reason) {
        (RequestStatus::Approved, _) => format!("You have left {club}."),
        (_, Some(reason)) => format!("Your leave request was declined: {reason}"),
        _ => "Your leave request was declined.".to_string(),
    }
}

async fn approve_join(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Extension(notifier): Extension<Arc<Notifier>>,
    Extension(config): Extension<Arc<Config>>,
    Path(request_id): Path<i32>,
) -> AppResult<Json<JoinRequest>> {
    review_join(claims, pool, notifier, config, request_id, true).await
}

async fn reject_join(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Extension(notifier): Extension<Arc<Notifier>>,
    Extension(config): Extension<Arc<Config>>,
    Path(request_id): Path<i32>,
) -> AppResult<Json<JoinRequest>> {
    review_join(claims, pool, notifier, config, request_id, false).await
}

async fn approve_leave(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Extension(notifier): Extension<Arc<Notifier>>,
    Path(request_id): Path<i32>,
) -> AppResult<Json<LeaveRequest>> {
    review_leave(claims, pool, notifier, request_id, true, None).await
}

async fn reject_leave(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Extension(notifier): Extension<Arc<Notifier>>,
    Path(request_id): Path<i32>,
    body: Option<Json<ReviewRequest>>,
) -> AppResult<Json<LeaveRequest>> {
    let reason = body.and_then(|Json(b)| clean(b.reason));
    review_leave(claims, pool, notifier, request_id, false, reason).await
}

pub fn app() -> Router {
    Router::new()
        .route("/clubs/:club_id/join", post(request_join))
        .route("/clubs/:club_id/leave", post(request_leave))
        .route("/clubs/:club_id/requests", get(list_requests))
        .route("/requests/join/:request_id/approve", post(approve_join))
        .route("/requests/join/:request_id/reject", post(reject_join))
        .route("/requests/leave/:request_id/approve", post(approve_leave))
        .route("/requests/leave/:request_id/reject", post(reject_leave))
}
