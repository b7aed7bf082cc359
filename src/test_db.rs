//! Postgres fixtures for tests that exercise real queries.
//!
//! `connect` opens one connection to `DATABASE_URL` and starts a test
//! transaction on it, so nothing a test writes is ever committed. When the
//! variable is unset the database tests return early. The database is expected
//! to be migrated already (`diesel migration run`).

use crate::{
    models::{Club, ClubMember, ClubRole, ClubStatus, User, UserRole},
    schema::*,
};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};

pub async fn connect() -> Option<AsyncPgConnection> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL is not set, skipping database test");
        return None;
    };
    let mut conn = AsyncPgConnection::establish(&url)
        .await
        .expect("connect to DATABASE_URL");
    conn.begin_test_transaction()
        .await
        .expect("begin test transaction");
    Some(conn)
}

/// A tag unique to this call, so fixtures never collide with existing rows.
fn tag() -> String {
    nanoid::nanoid!(10)
}

pub async fn user(conn: &mut AsyncPgConnection, role: UserRole) -> User {
    #[derive(Insertable)]
    #[diesel(table_name = users)]
    struct NewUser {
        google_id: String,
        email: String,
        name: String,
        role: &'static str,
    }

    let tag = tag();
    diesel::insert_into(users::table)
        .values(NewUser {
            google_id: format!("test-{tag}"),
            email: format!("{tag}@test.uni.edu"),
            name: format!("User {tag}"),
            role: role.as_str(),
        })
        .get_result::<User>(conn)
        .await
        .expect("insert user")
}

pub async fn club(conn: &mut AsyncPgConnection, creator: &User, status: ClubStatus) -> Club {
    #[derive(Insertable)]
    #[diesel(table_name = clubs)]
    struct NewClub {
        name: String,
        status: &'static str,
        created_by: i32,
    }

    diesel::insert_into(clubs::table)
        .values(NewClub {
            name: format!("Club {}", tag()),
            status: status.as_str(),
            created_by: creator.id,
        })
        .get_result::<Club>(conn)
        .await
        .expect("insert club")
}

pub async fn member(
    conn: &mut AsyncPgConnection,
    club: &Club,
    user: &User,
    role: ClubRole,
) -> ClubMember {
    #[derive(Insertable)]
    #[diesel(table_name = club_members)]
    struct NewMember {
        club_id: i32,
        user_id: i32,
        role: &'static str,
    }

    diesel::insert_into(club_members::table)
        .values(NewMember {
            club_id: club.id,
            user_id: user.id,
            role: role.as_str(),
        })
        .get_result::<ClubMember>(conn)
        .await
        .expect("insert club member")
}

/// An approved club led by a fresh user.
pub async fn led_club(conn: &mut AsyncPgConnection) -> (Club, User) {
    let leader = user(conn, UserRole::Student).await;
    let club = club(conn, &leader, ClubStatus::Approved).await;
    member(conn, &club, &leader, ClubRole::Leader).await;
    (club, leader)
}
