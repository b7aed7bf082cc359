use super::clean;
use crate::{
    access::{self, can_remove, keeps_a_leader},
    auth::{is_site_admin, ExtractAuth},
    error::{on_unique_violation, AppError, AppResult},
    models::{lower, Club, ClubMember, ClubRole, ClubStatus, NotificationKind, User, UserRole},
    notify::{Notifier, Outgoing},
    schema::*,
    DbPool,
};
use axum::{
    extract::{Path, Query},
    routing::{get, post, put},
    Extension, Json, Router,
};
use diesel::{dsl::count_star, prelude::*};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use scoped_futures::ScopedFutureExt;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClubResponse {
    #[serde(flatten)]
    club: Club,
    member_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    my_role: Option<ClubRole>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MemberResponse {
    user_id: i32,
    name: String,
    email: String,
    avatar_url: Option<String>,
    role: String,
    joined_at: chrono::NaiveDateTime,
}

async fn member_counts(
    conn: &mut AsyncPgConnection,
    club_ids: Vec<i32>,
) -> AppResult<HashMap<i32, i64>> {
    Ok(club_members::table
        .filter(club_members::club_id.eq_any(club_ids))
        .group_by(club_members::club_id)
        .select((club_members::club_id, count_star()))
        .load::<(i32, i64)>(conn)
        .await?
        .into_iter()
        .collect())
}

async fn load_clubs(
    conn: &mut AsyncPgConnection,
    clubs: Vec<(Club, Option<ClubRole>)>,
) -> AppResult<Vec<ClubResponse>> {
    let counts = member_counts(conn, clubs.iter().map(|c| c.0.id).collect()).await?;

    Ok(clubs
        .into_iter()
        .map(|(club, my_role)| ClubResponse {
            member_count: counts.get(&club.id).copied().unwrap_or(0),
            club,
            my_role,
        })
        .collect())
}

/// Club names are unique ignoring case.
async fn name_taken(
    conn: &mut AsyncPgConnection,
    name: &str,
    except: Option<i32>,
) -> AppResult<bool> {
    let mut query = clubs::table
        .filter(lower(clubs::name).eq(name.to_lowercase()))
        .select(clubs::id)
        .into_boxed();
    if let Some(id) = except {
        query = query.filter(clubs::id.ne(id));
    }
    Ok(query.first::<i32>(conn).await.optional()?.is_some())
}

#[derive(Deserialize)]
struct ListQuery {
    q: Option<String>,
    category: Option<String>,
}

async fn list(
    Extension(pool): Extension<DbPool>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<ClubResponse>>> {
    let conn = &mut pool.get().await?;

    let mut clubs_query = clubs::table
        .filter(clubs::status.eq(ClubStatus::Approved.as_str()))
        .order(clubs::name.asc())
        .into_boxed();
    if let Some(q) = clean(query.q) {
        clubs_query = clubs_query.filter(clubs::name.ilike(format!("%{q}%")));
    }
    if let Some(category) = clean(query.category) {
        clubs_query = clubs_query.filter(clubs::category.eq(category));
    }
    let clubs = clubs_query.load::<Club>(conn).await?;

    Ok(Json(
        load_clubs(conn, clubs.into_iter().map(|c| (c, None)).collect()).await?,
    ))
}

async fn mine(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
) -> AppResult<Json<Vec<ClubResponse>>> {
    let conn = &mut pool.get().await?;

    let clubs = club_members::table
        .inner_join(clubs::table)
        .filter(club_members::user_id.eq(claims.user_id))
        .order(clubs::name.asc())
        .load::<(ClubMember, Club)>(conn)
        .await?
        .into_iter()
        .map(|(member, club)| Ok((club, Some(member.role()?))))
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(Json(load_clubs(conn, clubs).await?))
}

async fn info(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Path(club_id): Path<i32>,
) -> AppResult<Json<ClubResponse>> {
    let conn = &mut pool.get().await?;

    let (club, role) = access::visible_club(conn, &claims, club_id).await?;

    Ok(Json(load_clubs(conn, vec![(club, role)]).await?.pop().ok_or_else(
        || anyhow::anyhow!("`load_clubs` should return one club"),
    )?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClubRequest {
    name: String,
    description: Option<String>,
    category: Option<String>,
    logo_url: Option<String>,
}

#[derive(Insertable)]
#[diesel(table_name = clubs)]
struct NewClub {
    name: String,
    description: Option<String>,
    category: Option<String>,
    logo_url: Option<String>,
    status: &'static str,
    created_by: i32,
}

const NAME_TAKEN: &str = "a club with that name already exists";

/// Inserts a PENDING club and makes its creator the LEADER.
async fn insert_club(conn: &mut AsyncPgConnection, new_club: NewClub) -> AppResult<Club> {
    #[derive(Insertable)]
    #[diesel(table_name = club_members)]
    struct NewMember {
        club_id: i32,
        user_id: i32,
        role: &'static str,
    }

    conn.transaction::<_, AppError, _>(|conn| {
        async move {
            let user_id = new_club.created_by;
            let club = diesel::insert_into(clubs::table)
                .values(new_club)
                .get_result::<Club>(conn)
                .await
                .map_err(on_unique_violation(NAME_TAKEN))?;
            diesel::insert_into(club_members::table)
                .values(NewMember {
                    club_id: club.id,
                    user_id,
                    role: ClubRole::Leader.as_str(),
                })
                .execute(conn)
                .await?;
            Ok(club)
        }
        .scope_boxed()
    })
    .await
}

async fn create(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Extension(notifier): Extension<Arc<Notifier>>,
    Json(req): Json<ClubRequest>,
) -> AppResult<Json<Club>> {
    let name = clean(Some(req.name))
        .ok_or_else(|| AppError::bad_request("club name must not be empty"))?;

    let conn = &mut pool.get().await?;

    if name_taken(conn, &name, None).await? {
        return Err(AppError::conflict(NAME_TAKEN));
    }

    let user_id = claims.user_id;
    let club = insert_club(
        conn,
        NewClub {
            name,
            description: clean(req.description),
            category: clean(req.category),
            logo_url: clean(req.logo_url),
            status: ClubStatus::Pending.as_str(),
            created_by: user_id,
        },
    )
    .await?;
    tracing::info!(club_id = club.id, user_id, "club submitted for approval");

    let admins = users::table
        .filter(users::role.eq(UserRole::Admin.as_str()))
        .select(users::id)
        .load::<i32>(conn)
        .await?;
    notifier.dispatch(
        admins,
        Outgoing::new(
            NotificationKind::ClubSubmitted,
            "New club awaiting approval",
            format!("{} was submitted for review.", club.name),
        )
        .link("/admin/clubs"),
    );

    Ok(Json(club))
}

#[derive(AsChangeset)]
#[diesel(table_name = clubs)]
struct ClubEdit {
    name: Option<String>,
    description: Option<String>,
    category: Option<String>,
    logo_url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClubEditRequest {
    name: Option<String>,
    description: Option<String>,
    category: Option<String>,
    logo_url: Option<String>,
}

async fn edit(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Path(club_id): Path<i32>,
    Json(req): Json<ClubEditRequest>,
) -> AppResult<Json<Club>> {
    let conn = &mut pool.get().await?;

    access::find_club(conn, club_id).await?;
    access::require_role(conn, &claims, club_id, ClubRole::Officer).await?;

    let edit = ClubEdit {
        name: clean(req.name),
        description: clean(req.description),
        category: clean(req.category),
        logo_url: clean(req.logo_url),
    };
    if edit.name.is_none()
        && edit.description.is_none()
        && edit.category.is_none()
        && edit.logo_url.is_none()
    {
        return Err(AppError::bad_request("nothing to update"));
    }
    if let Some(name) = &edit.name {
        if name_taken(conn, name, Some(club_id)).await? {
            return Err(AppError::conflict(NAME_TAKEN));
        }
    }

    let club = diesel::update(clubs::table.find(club_id))
        .set(edit)
        .get_result::<Club>(conn)
        .await
        .map_err(on_unique_violation(NAME_TAKEN))?;

    Ok(Json(club))
}

async fn members(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Path(club_id): Path<i32>,
) -> AppResult<Json<Vec<MemberResponse>>> {
    let conn = &mut pool.get().await?;

    access::visible_club(conn, &claims, club_id).await?;

    let members = club_members::table
        .inner_join(users::table)
        .filter(club_members::club_id.eq(club_id))
        .order(users::name.asc())
        .load::<(ClubMember, User)>(conn)
        .await?;

    Ok(Json(
        members
            .into_iter()
            .map(|(member, user)| MemberResponse {
                user_id: user.id,
                name: user.name,
                email: user.email,
                avatar_url: user.avatar_url,
                role: member.role,
                joined_at: member.joined_at,
            })
            .collect(),
    ))
}

#[derive(Deserialize)]
struct RoleRequest {
    role: ClubRole,
}

/// Changes a member's role while the club's leader rows are locked. Returns
/// the membership and whether anything changed.
async fn set_member_role(
    conn: &mut AsyncPgConnection,
    club_id: i32,
    user_id: i32,
    role: ClubRole,
) -> AppResult<(ClubMember, bool)> {
    conn.transaction::<_, AppError, _>(|conn| {
        async move {
            let leaders = access::lock_leaders(conn, club_id).await?;
            let member = access::membership(conn, club_id, user_id)
                .await?
                .ok_or_else(|| AppError::not_found("that user is not a member"))?;
            let current = member.role()?;
            if current == role {
                return Ok((member, false));
            }
            if !keeps_a_leader(current, leaders) {
                return Err(AppError::conflict("a club must keep at least one leader"));
            }

            let member = diesel::update(club_members::table.find(member.id))
                .set(club_members::role.eq(role.as_str()))
                .get_result::<ClubMember>(conn)
                .await?;
            Ok((member, true))
        }
        .scope_boxed()
    })
    .await
}

/// Deletes a membership if `actor` may remove it and the club keeps a leader.
async fn remove_from_club(
    conn: &mut AsyncPgConnection,
    club_id: i32,
    user_id: i32,
    actor: Option<ClubRole>,
    is_admin: bool,
) -> AppResult<()> {
    conn.transaction::<_, AppError, _>(|conn| {
        async move {
            let leaders = access::lock_leaders(conn, club_id).await?;
            let member = access::membership(conn, club_id, user_id)
                .await?
                .ok_or_else(|| AppError::not_found("that user is not a member"))?;
            let target = member.role()?;
            if !can_remove(actor, is_admin, target) {
                return Err(AppError::forbidden("you cannot remove this member"));
            }
            if !keeps_a_leader(target, leaders) {
                return Err(AppError::conflict("a club must keep at least one leader"));
            }

            diesel::delete(club_members::table.find(member.id))
                .execute(conn)
                .await?;
            Ok(())
        }
        .scope_boxed()
    })
    .await
}

async fn change_role(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Extension(notifier): Extension<Arc<Notifier>>,
    Path((club_id, user_id)): Path<(i32, i32)>,
    Json(req): Json<RoleRequest>,
) -> AppResult<Json<ClubMember>> {
    let conn = &mut pool.get().await?;

    let club = access::find_club(conn, club_id).await?;
    access::require_role(conn, &claims, club_id, ClubRole::Leader).await?;

    let (member, changed) = set_member_role(conn, club_id, user_id, req.role).await?;
    if !changed {
        return Ok(Json(member));
    }
    tracing::info!(club_id, user_id, role = %req.role, by = claims.user_id, "club role changed");

    notifier.dispatch(
        vec![user_id],
        Outgoing::new(
            NotificationKind::RoleChanged,
            format!("Your role in {} changed", club.name),
            format!("You are now {} of {}.", req.role.as_str().to_lowercase(), club.name),
        )
        .link(format!("/clubs/{club_id}")),
    );

    Ok(Json(member))
}

async fn remove_member(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Extension(notifier): Extension<Arc<Notifier>>,
    Path((club_id, user_id)): Path<(i32, i32)>,
) -> AppResult<Json<()>> {
    let conn = &mut pool.get().await?;

    let club = access::find_club(conn, club_id).await?;
    let actor = access::require_role(conn, &claims, club_id, ClubRole::Officer).await?;
    if user_id == claims.user_id {
        return Err(AppError::bad_request(
            "use a leave request to leave a club yourself",
        ));
    }

    let is_admin = is_site_admin(conn, &claims).await?;
    remove_from_club(conn, club_id, user_id, actor, is_admin).await?;
    tracing::info!(club_id, user_id, by = claims.user_id, "member removed");

    notifier.dispatch(
        vec![user_id],
        Outgoing::new(
            NotificationKind::Removed,
            format!("Removed from {}", club.name),
            format!("You are no longer a member of {}.", club.name),
        ),
    );

    Ok(Json(()))
}

pub fn app() -> Router {
    Router::new()
        .route("/club/list", get(list))
        .route("/club/mine", get(mine))
        .route("/club/create", post(create))
        .route("/club/info/:club_id", get(info))
        .route("/clubs/:club_id", put(edit))
        .route("/clubs/:club_id/members", get(members))
        .route(
            "/clubs/:club_id/members/:user_id",
            put(change_role).delete(remove_member),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_db;
    use axum::http::StatusCode;

    fn new_club(name: &str, created_by: i32) -> NewClub {
        NewClub {
            name: name.to_string(),
            description: None,
            category: None,
            logo_url: None,
            status: ClubStatus::Pending.as_str(),
            created_by,
        }
    }

    #[tokio::test]
    async fn creators_lead_their_pending_club() {
        let Some(mut conn) = test_db::connect().await else {
            return;
        };
        let conn = &mut conn;
        let student = test_db::user(conn, UserRole::Student).await;

        let name = format!("Origami {}", student.id);
        let club = insert_club(conn, new_club(&name, student.id)).await.unwrap();
        assert_eq!(club.status().unwrap(), ClubStatus::Pending);
        assert_eq!(
            access::role_in(conn, club.id, student.id).await.unwrap(),
            Some(ClubRole::Leader)
        );
    }

    #[tokio::test]
    async fn club_names_collide_ignoring_case() {
        let Some(mut conn) = test_db::connect().await else {
            return;
        };
        let conn = &mut conn;
        let (club, _) = test_db::led_club(conn).await;
        let student = test_db::user(conn, UserRole::Student).await;

        assert!(name_taken(conn, &club.name.to_uppercase(), None).await.unwrap());
        assert!(!name_taken(conn, &club.name, Some(club.id)).await.unwrap());

        // the insert itself refuses, even when the lookup was skipped
        let err = insert_club(conn, new_club(&club.name.to_uppercase(), student.id))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(access::role_in(conn, club.id, student.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn the_last_leader_cannot_be_demoted() {
        let Some(mut conn) = test_db::connect().await else {
            return;
        };
        let conn = &mut conn;
        let (club, leader) = test_db::led_club(conn).await;

        let (_, changed) = set_member_role(conn, club.id, leader.id, ClubRole::Leader)
            .await
            .unwrap();
        assert!(!changed);

        let err = set_member_role(conn, club.id, leader.id, ClubRole::Officer)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);

        let deputy = test_db::user(conn, UserRole::Student).await;
        test_db::member(conn, &club, &deputy, ClubRole::Member).await;
        let (member, changed) = set_member_role(conn, club.id, deputy.id, ClubRole::Leader)
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(member.role().unwrap(), ClubRole::Leader);

        set_member_role(conn, club.id, leader.id, ClubRole::Officer)
            .await
            .unwrap();
        assert_eq!(access::lock_leaders(conn, club.id).await.unwrap(), 1);
        let err = set_member_role(conn, club.id, deputy.id, ClubRole::Member)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn removals_respect_rank_and_leadership() {
        let Some(mut conn) = test_db::connect().await else {
            return;
        };
        let conn = &mut conn;
        let (club, leader) = test_db::led_club(conn).await;
        let officer = test_db::user(conn, UserRole::Student).await;
        test_db::member(conn, &club, &officer, ClubRole::Officer).await;
        let student = test_db::user(conn, UserRole::Student).await;
        test_db::member(conn, &club, &student, ClubRole::Member).await;

        let err = remove_from_club(conn, club.id, officer.id, Some(ClubRole::Officer), false)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);

        // admins outrank everyone but still cannot leave a club leaderless
        let err = remove_from_club(conn, club.id, leader.id, None, true)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);

        remove_from_club(conn, club.id, student.id, Some(ClubRole::Officer), false)
            .await
            .unwrap();
        assert!(access::membership(conn, club.id, student.id).await.unwrap().is_none());

        let err = remove_from_club(conn, club.id, student.id, Some(ClubRole::Leader), false)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
