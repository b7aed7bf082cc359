use super::clean;
use crate::{
    access,
    auth::{Claims, ExtractAuth},
    error::{AppError, AppResult},
    models::{ClubRole, Comment, NotificationKind, Post, User},
    notify::{Notifier, Outgoing},
    schema::*,
    DbPool,
};
use axum::{
    extract::Path,
    routing::{delete, get, post},
    Extension, Json, Router,
};
use chrono::NaiveDateTime;
use diesel::{dsl::count_star, prelude::*};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};

const MAX_POST_LENGTH: usize = 10_000;
const MAX_COMMENT_LENGTH: usize = 2_000;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Author {
    id: i32,
    name: String,
    avatar_url: Option<String>,
}

impl From<User> for Author {
    fn from(user: User) -> Self {
        Author {
            id: user.id,
            name: user.name,
            avatar_url: user.avatar_url,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PostResponse {
    id: i32,
    club_id: i32,
    content: String,
    image_url: Option<String>,
    created_at: NaiveDateTime,
    author: Author,
    like_count: i64,
    comment_count: i64,
    liked: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CommentResponse {
    id: i32,
    post_id: i32,
    content: String,
    created_at: NaiveDateTime,
    author: Author,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostRequest {
    content: String,
    image_url: Option<String>,
}

#[derive(Deserialize)]
struct CommentRequest {
    content: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LikeResponse {
    liked: bool,
    like_count: i64,
}

fn validate_text(text: String, max: usize, what: &'static str) -> AppResult<String> {
    let text = clean(Some(text))
        .ok_or_else(|| AppError::bad_request(format!("{what} must not be empty")))?;
    if text.chars().count() > max {
        return Err(AppError::bad_request(format!(
            "{what} must be at most {max} characters"
        )));
    }
    Ok(text)
}

async fn find_post(conn: &mut AsyncPgConnection, post_id: i32) -> AppResult<Post> {
    posts::table
        .find(post_id)
        .first::<Post>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::not_found("the post does not exist"))
}

async fn list_posts(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Path(club_id): Path<i32>,
) -> AppResult<Json<Vec<PostResponse>>> {
    let conn = &mut pool.get().await?;

    access::visible_club(conn, &claims, club_id).await?;

    let posts = posts::table
        .inner_join(users::table)
        .filter(posts::club_id.eq(club_id))
        .order(posts::created_at.desc())
        .load::<(Post, User)>(conn)
        .await?;
    let ids: Vec<i32> = posts.iter().map(|(p, _)| p.id).collect();

    let likes: HashMap<i32, i64> = post_likes::table
        .filter(post_likes::post_id.eq_any(ids.clone()))
        .group_by(post_likes::post_id)
        .select((post_likes::post_id, count_star()))
        .load::<(i32, i64)>(conn)
        .await?
        .into_iter()
        .collect();
    let comment_counts: HashMap<i32, i64> = comments::table
        .filter(comments::post_id.eq_any(ids.clone()))
        .group_by(comments::post_id)
        .select((comments::post_id, count_star()))
        .load::<(i32, i64)>(conn)
        .await?
        .into_iter()
        .collect();
    let liked: Vec<i32> = post_likes::table
        .filter(post_likes::post_id.eq_any(ids))
        .filter(post_likes::user_id.eq(claims.user_id))
        .select(post_likes::post_id)
        .load(conn)
        .await?;

    Ok(Json(
        posts
            .into_iter()
            .map(|(post, author)| PostResponse {
                like_count: likes.get(&post.id).copied().unwrap_or(0),
                comment_count: comment_counts.get(&post.id).copied().unwrap_or(0),
                liked: liked.contains(&post.id),
                id: post.id,
                club_id: post.club_id,
                content: post.content,
                image_url: post.image_url,
                created_at: post.created_at,
                author: author.into(),
            })
            .collect(),
    ))
}

async fn create_post(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Extension(notifier): Extension<Arc<Notifier>>,
    Path(club_id): Path<i32>,
    Json(req): Json<PostRequest>,
) -> AppResult<Json<Post>> {
    #[derive(Insertable)]
    #[diesel(table_name = posts)]
    struct NewPost {
        club_id: i32,
        author_id: i32,
        content: String,
        image_url: Option<String>,
    }

    let content = validate_text(req.content, MAX_POST_LENGTH, "post")?;

    let conn = &mut pool.get().await?;

    let club = access::find_club(conn, club_id).await?;
    access::require_role(conn, &claims, club_id, ClubRole::Officer).await?;

    let post = diesel::insert_into(posts::table)
        .values(NewPost {
            club_id,
            author_id: claims.user_id,
            content,
            image_url: clean(req.image_url),
        })
        .get_result::<Post>(conn)
        .await?;

    let recipients = access::member_ids(conn, club_id)
        .await?
        .into_iter()
        .filter(|&id| id != claims.user_id)
        .collect();
    notifier.dispatch(
        recipients,
        Outgoing::new(
            NotificationKind::NewPost,
            format!("New post in {}", club.name),
            preview(&post.content),
        )
        .link(format!("/clubs/{club_id}/posts/{}", post.id)),
    );

    Ok(Json(post))
}

/// First line of a post, shortened for notification bodies.
fn preview(content: &str) -> String {
    const LIMIT: usize = 120;
    let line = content.lines().next().unwrap_or_default();
    if line.chars().count() <= LIMIT && !content.contains('\n') {
        return line.to_string();
    }
    let short: String = line.chars().take(LIMIT).collect();
    format!("{}…", short.trim_end())
}

/// Authors can always delete their own content; club officers and admins can
/// delete anything in the club.
async fn may_moderate(
    conn: &mut AsyncPgConnection,
    claims: &Claims,
    club_id: i32,
    author_id: i32,
) -> AppResult<()> {
    if author_id == claims.user_id {
        return Ok(());
    }
    access::require_role(conn, claims, club_id, ClubRole::Officer).await?;
    Ok(())
}

async fn delete_post(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Path(post_id): Path<i32>,
) -> AppResult<Json<()>> {
    let conn = &mut pool.get().await?;

    let post = find_post(conn, post_id).await?;
    may_moderate(conn, &claims, post.club_id, post.author_id).await?;

    diesel::delete(posts::table.find(post.id))
        .execute(conn)
        .await?;

    Ok(Json(()))
}

async fn list_comments(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Path(post_id): Path<i32>,
) -> AppResult<Json<Vec<CommentResponse>>> {
    let conn = &mut pool.get().await?;

    let post = find_post(conn, post_id).await?;
    access::visible_club(conn, &claims, post.club_id).await?;

    let comments = comments::table
        .inner_join(users::table)
        .filter(comments::post_id.eq(post_id))
        .order(comments::created_at.asc())
        .load::<(Comment, User)>(conn)
        .await?;

    Ok(Json(
        comments
            .into_iter()
            .map(|(comment, author)| CommentResponse {
                id: comment.id,
                post_id: comment.post_id,
                content: comment.content,
                created_at: comment.created_at,
                author: author.into(),
            })
            .collect(),
    ))
}

async fn create_comment(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Extension(notifier): Extension<Arc<Notifier>>,
    Path(post_id): Path<i32>,
    Json(req): Json<CommentRequest>,
) -> AppResult<Json<Comment>> {
    #[derive(Insertable)]
    #[diesel(table_name = comments)]
    struct NewComment {
        post_id: i32,
        author_id: i32,
        content: String,
    }

    let content = validate_text(req.content, MAX_COMMENT_LENGTH, "comment")?;

    let conn = &mut pool.get().await?;

    let post = find_post(conn, post_id).await?;
    access::require_role(conn, &claims, post.club_id, ClubRole::Member).await?;

    let comment = diesel::insert_into(comments::table)
        .values(NewComment {
            post_id,
            author_id: claims.user_id,
            content,
        })
        .get_result::<Comment>(conn)
        .await?;

    if post.author_id != claims.user_id {
        notifier.dispatch(
            vec![post.author_id],
            Outgoing::new(
                NotificationKind::NewComment,
                "New comment on your post",
                preview(&comment.content),
            )
            .link(format!("/clubs/{}/posts/{}", post.club_id, post.id)),
        );
    }

    Ok(Json(comment))
}

async fn delete_comment(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Path(comment_id): Path<i32>,
) -> AppResult<Json<()>> {
    let conn = &mut pool.get().await?;

    let comment = comments::table
        .find(comment_id)
        .first::<Comment>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::not_found("the comment does not exist"))?;
    let post = find_post(conn, comment.post_id).await?;
    may_moderate(conn, &claims, post.club_id, comment.author_id).await?;

    diesel::delete(comments::table.find(comment.id))
        .execute(conn)
        .await?;

    Ok(Json(()))
}

/// Removes the user's like if there is one, otherwise adds it.
async fn flip_like(
    conn: &mut AsyncPgConnection,
    post_id: i32,
    user_id: i32,
) -> AppResult<LikeResponse> {
    #[derive(Insertable)]
    #[diesel(table_name = post_likes)]
    struct NewLike {
        post_id: i32,
        user_id: i32,
    }

    let removed = diesel::delete(
        post_likes::table
            .filter(post_likes::post_id.eq(post_id))
            .filter(post_likes::user_id.eq(user_id)),
    )
    .execute(conn)
    .await?;
    if removed == 0 {
        diesel::insert_into(post_likes::table)
            .values(NewLike { post_id, user_id })
            .on_conflict((post_likes::post_id, post_likes::user_id))
            .do_nothing()
            .execute(conn)
            .await?;
    }

    let like_count = post_likes::table
        .filter(post_likes::post_id.eq(post_id))
        .count()
        .get_result::<i64>(conn)
        .await?;

    Ok(LikeResponse {
        liked: removed == 0,
        like_count,
    })
}

async fn toggle_like(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Path(post_id): Path<i32>,
) -> AppResult<Json<LikeResponse>> {
    let conn = &mut pool.get().await?;

    let post = find_post(conn, post_id).await?;
    access::visible_club(conn, &claims, post.club_id).await?;

    Ok(Json(flip_like(conn, post_id, claims.user_id).await?))
}

pub fn app() -> Router {
    Router::new()
        .route("/clubs/:club_id/posts", get(list_posts).post(create_post))
        .route("/post/:post_id", delete(delete_post))
        .route(
            "/post/:post_id/comments",
            get(list_comments).post(create_comment),
        )
        .route("/post/:post_id/like", post(toggle_like))
        .route("/comment/:comment_id", delete(delete_comment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::UserRole, test_db};

    #[test]
    fn text_is_trimmed_and_bounded() {
        assert_eq!(validate_text("  hi  ".to_string(), 10, "post").unwrap(), "hi");
        assert!(validate_text("   ".to_string(), 10, "post").is_err());
        assert!(validate_text("x".repeat(11), 10, "post").is_err());
    }

    #[test]
    fn previews_are_single_line_and_short() {
        assert_eq!(preview("Meeting moved"), "Meeting moved");
        assert_eq!(preview("Meeting moved\nto room 4"), "Meeting moved…");
        let long = "a".repeat(200);
        assert_eq!(preview(&long).chars().count(), 121);
    }

    #[tokio::test]
    async fn likes_toggle_per_user() {
        let Some(mut conn) = test_db::connect().await else {
            return;
        };
        let conn = &mut conn;
        let (club, leader) = test_db::led_club(conn).await;
        let fan = test_db::user(conn, UserRole::Student).await;

        let post_id = diesel::insert_into(posts::table)
            .values((
                posts::club_id.eq(club.id),
                posts::author_id.eq(leader.id),
                posts::content.eq("Tournament on Friday"),
            ))
            .returning(posts::id)
            .get_result::<i32>(conn)
            .await
            .unwrap();

        let like = flip_like(conn, post_id, fan.id).await.unwrap();
        assert!(like.liked);
        assert_eq!(like.like_count, 1);

        let like = flip_like(conn, post_id, leader.id).await.unwrap();
        assert!(like.liked);
        assert_eq!(like.like_count, 2);

        let like = flip_like(conn, post_id, fan.id).await.unwrap();
        assert!(!like.liked);
        assert_eq!(like.like_count, 1);
    }
}
