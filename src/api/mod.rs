use axum::{routing::get, Json, Router};
use serde::Deserialize;

pub mod admin;
pub mod attendance;
pub mod auth;
pub mod club;
pub mod membership;
pub mod notification;
pub mod post;
pub mod report;
pub mod schedule;
pub mod upload;

async fn health() -> Json<&'static str> {
    Json("ok")
}

/// Club-scoped routes live under `/clubs/:club_id/..`; `/club/..` holds the
/// collection routes so static and parameter segments never share a position.
pub fn app() -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/auth", auth::app())
        .merge(club::app())
        .merge(membership::app())
        .merge(post::app())
        .merge(attendance::app())
        .merge(schedule::app())
        .merge(notification::app())
        .merge(report::app())
        .merge(upload::app())
        .nest("/admin", admin::app())
}

/// Trims optional free text, treating blank input as absent.
pub(crate) fn clean(text: Option<String>) -> Option<String> {
    text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty())
}

#[derive(Deserialize)]
pub(crate) struct ReviewRequest {
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_drops_blank_text() {
        assert_eq!(clean(Some("  hi ".to_string())), Some("hi".to_string()));
        assert_eq!(clean(Some("   ".to_string())), None);
        assert_eq!(clean(None), None);
    }
}
