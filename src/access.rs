//! Club-level permission checks shared by the handlers.

use crate::{
    auth::{is_site_admin, Claims},
    error::{AppError, AppResult},
    models::{Club, ClubMember, ClubRole, ClubStatus},
    schema::*,
};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

pub async fn find_club(conn: &mut AsyncPgConnection, club_id: i32) -> AppResult<Club> {
    clubs::table
        .find(club_id)
        .first::<Club>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::not_found("the club does not exist"))
}

pub async fn membership(
    conn: &mut AsyncPgConnection,
    club_id: i32,
    user_id: i32,
) -> AppResult<Option<ClubMember>> {
    Ok(club_members::table
        .filter(club_members::club_id.eq(club_id))
        .filter(club_members::user_id.eq(user_id))
        .first::<ClubMember>(conn)
        .await
        .optional()?)
}

pub async fn role_in(
    conn: &mut AsyncPgConnection,
    club_id: i32,
    user_id: i32,
) -> AppResult<Option<ClubRole>> {
    Ok(membership(conn, club_id, user_id)
        .await?
        .map(|m| m.role())
        .transpose()?)
}

/// Fails unless the caller holds at least `min` in the club or is a site admin.
/// Returns the caller's club role, if any.
pub async fn require_role(
    conn: &mut AsyncPgConnection,
    claims: &Claims,
    club_id: i32,
    min: ClubRole,
) -> AppResult<Option<ClubRole>> {
    let role = role_in(conn, club_id, claims.user_id).await?;
    check_role(role, is_site_admin(conn, claims).await?, min)?;
    Ok(role)
}

pub fn check_role(role: Option<ClubRole>, is_admin: bool, min: ClubRole) -> AppResult<()> {
    if is_admin || role.map_or(false, |r| r >= min) {
        return Ok(());
    }
    Err(match min {
        ClubRole::Member => AppError::forbidden("you are not a member of this club"),
        ClubRole::Officer => AppError::forbidden("only club officers can do that"),
        ClubRole::Leader => AppError::forbidden("only club leaders can do that"),
    })
}

/// Unapproved clubs are visible to their own members and admins only.
pub fn can_view(club: &Club, role: Option<ClubRole>, is_admin: bool) -> bool {
    is_admin || role.is_some() || matches!(club.status(), Ok(ClubStatus::Approved))
}

/// Loads a club the caller may see, with the caller's role in it. Hidden
/// clubs look the same as missing ones.
pub async fn visible_club(
    conn: &mut AsyncPgConnection,
    claims: &Claims,
    club_id: i32,
) -> AppResult<(Club, Option<ClubRole>)> {
    let club = find_club(conn, club_id).await?;
    let role = role_in(conn, club_id, claims.user_id).await?;
    if !can_view(&club, role, is_site_admin(conn, claims).await?) {
        return Err(AppError::not_found("the club does not exist"));
    }
    Ok((club, role))
}

pub fn require_approved(club: &Club) -> AppResult<()> {
    match club.status()? {
        ClubStatus::Approved => Ok(()),
        _ => Err(AppError::bad_request("the club has not been approved")),
    }
}

/// Officers may remove plain members; leaders may remove anyone but themselves.
pub fn can_remove(actor: Option<ClubRole>, is_admin: bool, target: ClubRole) -> bool {
    if is_admin {
        return true;
    }
    match actor {
        Some(ClubRole::Leader) => true,
        Some(ClubRole::Officer) => target == ClubRole::Member,
        _ => false,
    }
}

pub async fn leader_count(conn: &mut AsyncPgConnection, club_id: i32) -> AppResult<i64> {
    Ok(club_members::table
        .filter(club_members::club_id.eq(club_id))
        .filter(club_members::role.eq(ClubRole::Leader.as_str()))
        .count()
        .get_result::<i64>(conn)
        .await?)
}

/// Locks the club's leader rows until the surrounding transaction ends and
/// returns how many there are. Anything that can take away a leader calls this
/// first, so two such changes to one club run one after the other.
pub async fn lock_leaders(conn: &mut AsyncPgConnection, club_id: i32) -> AppResult<i64> {
    let leaders = club_members::table
        .filter(club_members::club_id.eq(club_id))
        .filter(club_members::role.eq(ClubRole::Leader.as_str()))
        .select(club_members::id)
        .for_update()
        .load::<i32>(conn)
        .await?;
    Ok(leaders.len() as i64)
}

/// A club keeps at least one leader after `member` stops being one.
pub fn keeps_a_leader(member_role: ClubRole, leaders: i64) -> bool {
    member_role != ClubRole::Leader || leaders > 1
}

pub async fn member_ids(conn: &mut AsyncPgConnection, club_id: i32) -> AppResult<Vec<i32>> {
    Ok(club_members::table
        .filter(club_members::club_id.eq(club_id))
        .select(club_members::user_id)
        .load::<i32>(conn)
        .await?)
}

pub async fn officer_ids(conn: &mut AsyncPgConnection, club_id: i32) -> AppResult<Vec<i32>> {
    Ok(club_members::table
        .filter(club_members::club_id.eq(club_id))
        .filter(club_members::role.eq_any(vec![
            ClubRole::Leader.as_str(),
            ClubRole::Officer.as_str(),
        ]))
        .select(club_members::user_id)
        .load::<i32>(conn)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::UserRole, test_db};
    use axum::http::StatusCode;
    use chrono::NaiveDateTime;

    fn club(status: ClubStatus) -> Club {
        Club {
            id: 1,
            name: "Chess".to_string(),
            description: None,
            category: None,
            logo_url: None,
            status: status.as_str().to_string(),
            rejection_reason: None,
            created_by: 1,
            created_at: NaiveDateTime::default(),
        }
    }

    #[test]
    fn roles_meet_minimums() {
        assert!(check_role(Some(ClubRole::Leader), false, ClubRole::Officer).is_ok());
        assert!(check_role(Some(ClubRole::Officer), false, ClubRole::Officer).is_ok());
        assert!(check_role(None, true, ClubRole::Leader).is_ok());

        let err = check_role(Some(ClubRole::Member), false, ClubRole::Officer).unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert!(check_role(None, false, ClubRole::Member).is_err());
    }

    #[test]
    fn pending_clubs_are_hidden_from_outsiders() {
        assert!(can_view(&club(ClubStatus::Approved), None, false));
        assert!(!can_view(&club(ClubStatus::Pending), None, false));
        assert!(can_view(&club(ClubStatus::Pending), Some(ClubRole::Leader), false));
        assert!(can_view(&club(ClubStatus::Rejected), None, true));
    }

    #[test]
    fn officers_only_remove_members() {
        assert!(can_remove(Some(ClubRole::Officer), false, ClubRole::Member));
        assert!(!can_remove(Some(ClubRole::Officer), false, ClubRole::Officer));
        assert!(!can_remove(Some(ClubRole::Officer), false, ClubRole::Leader));
        assert!(can_remove(Some(ClubRole::Leader), false, ClubRole::Officer));
        assert!(!can_remove(Some(ClubRole::Member), false, ClubRole::Member));
        assert!(can_remove(None, true, ClubRole::Leader));
    }

    #[test]
    fn last_leader_is_kept() {
        assert!(!keeps_a_leader(ClubRole::Leader, 1));
        assert!(keeps_a_leader(ClubRole::Leader, 2));
        assert!(keeps_a_leader(ClubRole::Member, 1));
    }

    #[tokio::test]
    async fn pending_clubs_stay_hidden_from_former_admins() {
        let Some(mut conn) = test_db::connect().await else {
            return;
        };
        let conn = &mut conn;
        let founder = test_db::user(conn, UserRole::Student).await;
        let pending = test_db::club(conn, &founder, ClubStatus::Pending).await;
        let admin = test_db::user(conn, UserRole::Admin).await;
        let claims = Claims {
            user_id: admin.id,
            role: UserRole::Admin,
            exp: u64::MAX,
        };

        let (club, role) = visible_club(conn, &claims, pending.id).await.unwrap();
        assert_eq!((club.id, role), (pending.id, None));
        assert!(require_role(conn, &claims, pending.id, ClubRole::Leader).await.is_ok());

        diesel::update(users::table.find(admin.id))
            .set(users::role.eq(UserRole::Student.as_str()))
            .execute(conn)
            .await
            .unwrap();
        let err = visible_club(conn, &claims, pending.id).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        let err = require_role(conn, &claims, pending.id, ClubRole::Member)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }
}
