use super::clean;
use crate::{
    access,
    attendance::{self, MemberAttendance},
    auth::ExtractAuth,
    error::{AppError, AppResult},
    models::{ActivitySession, Attendance, AttendanceStatus, ClubRole, NotificationKind},
    notify::{Notifier, Outgoing},
    schema::*,
    DbPool,
};
use axum::{
    extract::Path,
    routing::{get, put},
    Extension, Json, Router,
};
use chrono::{NaiveDate, Utc};
use diesel::{prelude::*, upsert::excluded};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use scoped_futures::ScopedFutureExt;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, sync::Arc};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRequest {
    title: String,
    session_date: NaiveDate,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionDetail {
    #[serde(flatten)]
    session: ActivitySession,
    records: Vec<Attendance>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttendanceEntry {
    user_id: i32,
    status: AttendanceStatus,
}

async fn find_session(
    conn: &mut AsyncPgConnection,
    session_id: i32,
) -> AppResult<ActivitySession> {
    activity_sessions::table
        .find(session_id)
        .first::<ActivitySession>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::not_found("the session does not exist"))
}

async fn create_session(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Extension(notifier): Extension<Arc<Notifier>>,
    Path(club_id): Path<i32>,
    Json(req): Json<SessionRequest>,
) -> AppResult<Json<ActivitySession>> {
    #[derive(Insertable)]
    #[diesel(table_name = activity_sessions)]
    struct NewSession {
        club_id: i32,
        title: String,
        session_date: NaiveDate,
        created_by: i32,
    }

    let title = clean(Some(req.title))
        .ok_or_else(|| AppError::bad_request("session title must not be empty"))?;

    let conn = &mut pool.get().await?;

    let club = access::find_club(conn, club_id).await?;
    access::require_approved(&club)?;
    access::require_role(conn, &claims, club_id, ClubRole::Officer).await?;

    let session = diesel::insert_into(activity_sessions::table)
        .values(NewSession {
            club_id,
            title,
            session_date: req.session_date,
            created_by: claims.user_id,
        })
        .get_result::<ActivitySession>(conn)
        .await?;

    let recipients = access::member_ids(conn, club_id)
        .await?
        .into_iter()
        .filter(|&id| id != claims.user_id)
        .collect();
    notifier.dispatch(
        recipients,
        Outgoing::new(
            NotificationKind::SessionCreated,
            format!("New session in {}", club.name),
            format!("{} on {}", session.title, session.session_date),
        )
        .link(format!("/clubs/{club_id}/sessions/{}", session.id)),
    );

    Ok(Json(session))
}

async fn list_sessions(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Path(club_id): Path<i32>,
) -> AppResult<Json<Vec<ActivitySession>>> {
    let conn = &mut pool.get().await?;

    access::find_club(conn, club_id).await?;
    access::require_role(conn, &claims, club_id, ClubRole::Member).await?;

    let sessions = activity_sessions::table
        .filter(activity_sessions::club_id.eq(club_id))
        .order((activity_sessions::session_date.desc(), activity_sessions::id.desc()))
        .load::<ActivitySession>(conn)
        .await?;

    Ok(Json(sessions))
}

async fn session_info(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Path(session_id): Path<i32>,
) -> AppResult<Json<SessionDetail>> {
    let conn = &mut pool.get().await?;

    let session = find_session(conn, session_id).await?;
    access::require_role(conn, &claims, session.club_id, ClubRole::Member).await?;

    let records = attendances::table
        .filter(attendances::session_id.eq(session.id))
        .order(attendances::user_id)
        .load::<Attendance>(conn)
        .await?;

    Ok(Json(SessionDetail { session, records }))
}

async fn delete_session(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Path(session_id): Path<i32>,
) -> AppResult<Json<()>> {
    let conn = &mut pool.get().await?;

    let session = find_session(conn, session_id).await?;
    access::require_role(conn, &claims, session.club_id, ClubRole::Officer).await?;

    diesel::delete(activity_sessions::table.find(session.id))
        .execute(conn)
        .await?;

    Ok(Json(()))
}

/// Rejects duplicate entries and users outside the club.
fn check_entries(entries: &[AttendanceEntry], members: &HashSet<i32>) -> AppResult<()> {
    let mut seen = HashSet::new();
    for entry in entries {
        if !seen.insert(entry.user_id) {
            return Err(AppError::bad_request(format!(
                "user {} appears more than once",
                entry.user_id
            )));
        }
        if !members.contains(&entry.user_id) {
            return Err(AppError::bad_request(format!(
                "user {} is not a member of this club",
                entry.user_id
            )));
        }
    }
    Ok(())
}

/// Writes one record per entry, replacing any earlier status for the same
/// member, and returns the session's full attendance.
async fn upsert_attendance(
    conn: &mut AsyncPgConnection,
    session_id: i32,
    entries: &[AttendanceEntry],
) -> AppResult<Vec<Attendance>> {
    #[derive(Insertable)]
    #[diesel(table_name = attendances)]
    struct NewAttendance {
        session_id: i32,
        user_id: i32,
        status: &'static str,
    }

    let rows: Vec<NewAttendance> = entries
        .iter()
        .map(|entry| NewAttendance {
            session_id,
            user_id: entry.user_id,
            status: entry.status.as_str(),
        })
        .collect();

    conn.transaction::<_, AppError, _>(|conn| {
        async move {
            if !rows.is_empty() {
                diesel::insert_into(attendances::table)
                    .values(rows)
                    .on_conflict((attendances::session_id, attendances::user_id))
                    .do_update()
                    .set((
                        attendances::status.eq(excluded(attendances::status)),
                        attendances::recorded_at.eq(Utc::now().naive_utc()),
                    ))
                    .execute(conn)
                    .await?;
            }

            Ok(attendances::table
                .filter(attendances::session_id.eq(session_id))
                .order(attendances::user_id)
                .load::<Attendance>(conn)
                .await?)
        }
        .scope_boxed()
    })
    .await
}

async fn record_attendance(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Path(session_id): Path<i32>,
    Json(entries): Json<Vec<AttendanceEntry>>,
) -> AppResult<Json<Vec<Attendance>>> {
    let conn = &mut pool.get().await?;

    let session = find_session(conn, session_id).await?;
    access::require_role(conn, &claims, session.club_id, ClubRole::Officer).await?;

    let members: HashSet<i32> = access::member_ids(conn, session.club_id)
        .await?
        .into_iter()
        .collect();
    check_entries(&entries, &members)?;

    let records = upsert_attendance(conn, session_id, &entries).await?;
    tracing::info!(session_id, count = entries.len(), "attendance recorded");

    Ok(Json(records))
}

async fn attendance_summary(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Path(club_id): Path<i32>,
) -> AppResult<Json<Vec<MemberAttendance>>> {
    let conn = &mut pool.get().await?;

    access::find_club(conn, club_id).await?;
    access::require_role(conn, &claims, club_id, ClubRole::Officer).await?;

    let members = access::member_ids(conn, club_id).await?;
    let records = attendances::table
        .inner_join(activity_sessions::table)
        .filter(activity_sessions::club_id.eq(club_id))
        .select((attendances::user_id, attendances::status))
        .load::<(i32, String)>(conn)
        .await?
        .into_iter()
        .map(|(user_id, status)| Ok((user_id, status.parse()?)))
        .collect::<anyhow::Result<Vec<(i32, AttendanceStatus)>>>()?;

    Ok(Json(attendance::summarize(&members, records)))
}

pub fn app() -> Router {
    Router::new()
        .route(
            "/clubs/:club_id/sessions",
            get(list_sessions).post(create_session),
        )
        .route(
            "/clubs/:club_id/attendance/summary",
            get(attendance_summary),
        )
        .route(
            "/sessions/:session_id",
            get(session_info).delete(delete_session),
        )
        .route("/sessions/:session_id/attendance", put(record_attendance))
}
