use crate::{
    access,
    auth::ExtractAuth,
    error::{AppError, AppResult},
    models::{ClubRole, ClubSchedule},
    schedule::{self, Slot},
    schema::*,
    DbPool,
};
use axum::{
    extract::{Path, Query},
    routing::{get, put},
    Extension, Json, Router,
};
use chrono::NaiveTime;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleRequest {
    title: String,
    room: String,
    day_of_week: i16,
    start_time: NaiveTime,
    end_time: NaiveTime,
}

impl ScheduleRequest {
    fn slot(&self) -> Slot<'_> {
        Slot {
            room: &self.room,
            day_of_week: self.day_of_week,
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }
}

#[derive(Deserialize)]
struct ScheduleQuery {
    room: Option<String>,
    day: Option<i16>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleResponse {
    #[serde(flatten)]
    schedule: ClubSchedule,
    club_name: String,
}

#[derive(AsChangeset, Insertable)]
#[diesel(table_name = club_schedules)]
struct ScheduleFields {
    title: String,
    room: String,
    day_of_week: i16,
    start_time: NaiveTime,
    end_time: NaiveTime,
}

/// Validates the request and checks it against every club's bookings that day.
async fn checked_fields(
    conn: &mut AsyncPgConnection,
    req: ScheduleRequest,
    ignore_id: Option<i32>,
) -> AppResult<ScheduleFields> {
    let title = req.title.trim().to_string();
    if title.is_empty() {
        return Err(AppError::bad_request("title must not be empty"));
    }
    let slot = req.slot();
    schedule::validate(&slot).map_err(AppError::bad_request)?;

    let same_day = club_schedules::table
        .inner_join(clubs::table)
        .filter(club_schedules::day_of_week.eq(req.day_of_week))
        .select((club_schedules::all_columns, clubs::name))
        .load::<(ClubSchedule, String)>(conn)
        .await?;
    let (existing, names): (Vec<ClubSchedule>, Vec<String>) = same_day.into_iter().unzip();

    if let Some(conflict) = schedule::find_conflict(&existing, &slot, ignore_id) {
        let club_name = existing
            .iter()
            .position(|s| s.id == conflict.id)
            .and_then(|i| names.get(i))
            .map_or("another club", String::as_str);
        return Err(AppError::conflict(format!(
            "{} is booked by {} on {} from {} to {}",
            conflict.room,
            club_name,
            schedule::day_name(conflict.day_of_week),
            conflict.start_time.format("%H:%M"),
            conflict.end_time.format("%H:%M"),
        )));
    }

    Ok(ScheduleFields {
        title,
        room: req.room.trim().to_string(),
        day_of_week: req.day_of_week,
        start_time: req.start_time,
        end_time: req.end_time,
    })
}

async fn find_schedule(conn: &mut AsyncPgConnection, id: i32) -> AppResult<ClubSchedule> {
    club_schedules::table
        .find(id)
        .first::<ClubSchedule>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::not_found("the schedule does not exist"))
}

async fn list_club_schedules(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Path(club_id): Path<i32>,
) -> AppResult<Json<Vec<ClubSchedule>>> {
    let conn = &mut pool.get().await?;

    access::visible_club(conn, &claims, club_id).await?;

    let schedules = club_schedules::table
        .filter(club_schedules::club_id.eq(club_id))
        .order((club_schedules::day_of_week, club_schedules::start_time))
        .load::<ClubSchedule>(conn)
        .await?;

    Ok(Json(schedules))
}

async fn all_schedules(
    ExtractAuth(_): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Query(query): Query<ScheduleQuery>,
) -> AppResult<Json<Vec<ScheduleResponse>>> {
    let conn = &mut pool.get().await?;

    let mut q = club_schedules::table
        .inner_join(clubs::table)
        .select((club_schedules::all_columns, clubs::name))
        .into_boxed();
    if let Some(day) = query.day {
        q = q.filter(club_schedules::day_of_week.eq(day));
    }

    let schedules = q
        .order((club_schedules::day_of_week, club_schedules::start_time))
        .load::<(ClubSchedule, String)>(conn)
        .await?;

    let room = query
        .room
        .as_deref()
        .map(schedule::normalize_room)
        .filter(|r| !r.is_empty());

    Ok(Json(
        schedules
            .into_iter()
            .filter(|(s, _)| {
                room.as_ref()
                    .map_or(true, |r| schedule::normalize_room(&s.room) == *r)
            })
            .map(|(schedule, club_name)| ScheduleResponse {
                schedule,
                club_name,
            })
            .collect(),
    ))
}

async fn create_schedule(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Path(club_id): Path<i32>,
    Json(req): Json<ScheduleRequest>,
) -> AppResult<Json<ClubSchedule>> {
    #[derive(Insertable)]
    #[diesel(table_name = club_schedules)]
    struct NewSchedule {
        club_id: i32,
        #[diesel(embed)]
        fields: ScheduleFields,
    }

    let conn = &mut pool.get().await?;

    let club = access::find_club(conn, club_id).await?;
    access::require_approved(&club)?;
    access::require_role(conn, &claims, club_id, ClubRole::Officer).await?;

    let fields = checked_fields(conn, req, None).await?;
    let schedule = diesel::insert_into(club_schedules::table)
        .values(NewSchedule { club_id, fields })
        .get_result::<ClubSchedule>(conn)
        .await?;

    Ok(Json(schedule))
}

async fn update_schedule(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Path(id): Path<i32>,
    Json(req): Json<ScheduleRequest>,
) -> AppResult<Json<ClubSchedule>> {
    let conn = &mut pool.get().await?;

    let current = find_schedule(conn, id).await?;
    access::require_role(conn, &claims, current.club_id, ClubRole::Officer).await?;

    let fields = checked_fields(conn, req, Some(id)).await?;
    let schedule = diesel::update(club_schedules::table.find(id))
        .set(fields)
        .get_result::<ClubSchedule>(conn)
        .await?;

    Ok(Json(schedule))
}

async fn delete_schedule(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Path(id): Path<i32>,
) -> AppResult<Json<()>> {
    let conn = &mut pool.get().await?;

    let current = find_schedule(conn, id).await?;
    access::require_role(conn, &claims, current.club_id, ClubRole::Officer).await?;

    diesel::delete(club_schedules::table.find(id))
        .execute(conn)
        .await?;

    Ok(Json(()))
}

pub fn app() -> Router {
    Router::new()
        .route(
            "/clubs/:club_id/schedules",
            get(list_club_schedules).post(create_schedule),
        )
        .route("/schedules", get(all_schedules))
        .route(
            "/schedules/:id",
            put(update_schedule).delete(delete_schedule),
        )
}
