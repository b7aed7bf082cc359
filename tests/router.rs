use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Extension, Router,
};
use campus_club_hub::{
    auth::{generate_jwt, Keys, SESSION_LENGTH},
    models::{User, UserRole},
};
use chrono::NaiveDateTime;
use std::sync::Arc;
use tower::ServiceExt;

// "router tests need a secret too"
const SECRET: &str = "cm91dGVyIHRlc3RzIG5lZWQgYSBzZWNyZXQgdG9v";

fn keys() -> Arc<Keys> {
    Keys::from_base64_secret(SECRET).unwrap()
}

fn app() -> Router {
    campus_club_hub::app().layer(Extension(keys()))
}

fn token(role: UserRole) -> String {
    token_for(12, role)
}

fn token_for(id: i32, role: UserRole) -> String {
    let user = User {
        id,
        google_id: format!("google-{id}"),
        email: "grace@uni.edu".to_string(),
        name: "Grace".to_string(),
        avatar_url: None,
        role: role.as_str().to_string(),
        created_at: NaiveDateTime::default(),
    };
    generate_jwt(&keys(), &user, SESSION_LENGTH).unwrap()
}

fn get(uri: &str, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn status_of(request: Request<Body>) -> StatusCode {
    app().oneshot(request).await.unwrap().status()
}

#[tokio::test]
async fn health_needs_no_session() {
    assert_eq!(status_of(get("/api/health", None)).await, StatusCode::OK);
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    for uri in [
        "/api/auth/me",
        "/api/club/mine",
        "/api/notifications",
        "/api/schedules",
        "/api/clubs/1/posts",
    ] {
        assert_eq!(
            status_of(get(uri, None)).await,
            StatusCode::UNAUTHORIZED,
            "{uri}"
        );
    }
}

#[tokio::test]
async fn forged_token_is_unauthorized() {
    let status = status_of(get("/api/notifications", Some("not.a.jwt"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let foreign = Keys::from_base64_secret("c29tZWJvZHkgZWxzZQ==").unwrap();
    let user = User {
        id: 1,
        google_id: "g".to_string(),
        email: "x@uni.edu".to_string(),
        name: "X".to_string(),
        avatar_url: None,
        role: UserRole::Admin.as_str().to_string(),
        created_at: NaiveDateTime::default(),
    };
    let forged = generate_jwt(&foreign, &user, SESSION_LENGTH).unwrap();
    let status = status_of(get("/api/admin/users", Some(&forged))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn students_cannot_reach_admin_routes() {
    let student = token(UserRole::Student);
    for uri in ["/api/admin/users", "/api/admin/clubs/pending", "/api/admin/reports"] {
        assert_eq!(
            status_of(get(uri, Some(&student))).await,
            StatusCode::FORBIDDEN,
            "{uri}"
        );
    }
}

#[tokio::test]
async fn admin_tokens_need_a_current_admin_account() {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        return;
    };
    let app = app().layer(Extension(campus_club_hub::connect_to_db(&url).unwrap()));

    // signed correctly and claiming ADMIN, but no such user row
    let orphan = token_for(-1, UserRole::Admin);
    let response = app
        .oneshot(get("/api/admin/users", Some(&orphan)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn websocket_requires_query_token() {
    assert_eq!(status_of(get("/api/ws", None)).await, StatusCode::UNAUTHORIZED);
    assert_eq!(
        status_of(get("/api/ws?token=garbage", None)).await,
        StatusCode::UNAUTHORIZED
    );
}

#[tokio::test]
async fn errors_are_json() {
    let response = app().oneshot(get("/api/auth/me", None)).await.unwrap();
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["status"], 401);
    assert!(value["message"].is_string());
}

#[tokio::test]
async fn unknown_routes_are_not_found() {
    assert_eq!(
        status_of(get("/api/nowhere", None)).await,
        StatusCode::NOT_FOUND
    );
}
