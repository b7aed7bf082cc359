use crate::{
    auth::ExtractAuth,
    error::{AppError, AppResult},
    models::{Report, ReportStatus, ReportTarget},
    schema::*,
    DbPool,
};
use axum::{routing::post, Extension, Json, Router};
use diesel::{dsl::exists, prelude::*, select};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Deserialize;

const MAX_REASON_LENGTH: usize = 1_000;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportRequest {
    target_type: ReportTarget,
    target_id: i32,
    reason: String,
}

async fn target_exists(
    conn: &mut AsyncPgConnection,
    target: ReportTarget,
    id: i32,
) -> AppResult<bool> {
    let found = match target {
        ReportTarget::Post => {
            select(exists(posts::table.find(id)))
                .get_result::<bool>(conn)
                .await?
        }
        ReportTarget::Comment => {
            select(exists(comments::table.find(id)))
                .get_result::<bool>(conn)
                .await?
        }
        ReportTarget::Club => {
            select(exists(clubs::table.find(id)))
                .get_result::<bool>(conn)
                .await?
        }
    };
    Ok(found)
}

async fn create_report(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Json(req): Json<ReportRequest>,
) -> AppResult<Json<Report>> {
    #[derive(Insertable)]
    #[diesel(table_name = reports)]
    struct NewReport {
        reporter_id: i32,
        target_type: &'static str,
        target_id: i32,
        reason: String,
        status: &'static str,
    }

    let reason = req.reason.trim().to_string();
    if reason.is_empty() {
        return Err(AppError::bad_request("a reason is required"));
    }
    if reason.chars().count() > MAX_REASON_LENGTH {
        return Err(AppError::bad_request(format!(
            "reason must be at most {MAX_REASON_LENGTH} characters"
        )));
    }

    let conn = &mut pool.get().await?;

    if !target_exists(conn, req.target_type, req.target_id).await? {
        return Err(AppError::not_found(format!(
            "the reported {} does not exist",
            req.target_type.as_str().to_lowercase()
        )));
    }

    let report = diesel::insert_into(reports::table)
        .values(NewReport {
            reporter_id: claims.user_id,
            target_type: req.target_type.as_str(),
            target_id: req.target_id,
            reason,
            status: ReportStatus::Open.as_str(),
        })
        .get_result::<Report>(conn)
        .await?;

    tracing::info!(
        report_id = report.id,
        target = %req.target_type,
        target_id = req.target_id,
        "content reported"
    );

    Ok(Json(report))
}

pub fn app() -> Router {
    Router::new().route("/reports", post(create_report))
}
