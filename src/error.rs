use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde::Serialize;
use std::borrow::Cow;

#[derive(Debug)]
pub enum AppError {
    InternalServerError(anyhow::Error),
    ResponseStatusError(StatusCode, Cow<'static, str>),
}

pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct AppErrorResponse {
            status: u16,
            message: Cow<'static, str>,
        }

        match self {
            AppError::InternalServerError(err) => {
                tracing::error!("internal error: {err:#}");
                AppError::from(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
                    .into_response()
            }
            AppError::ResponseStatusError(code, s) => (
                code,
                Json(AppErrorResponse {
                    status: code.as_u16(),
                    message: s,
                }),
            )
                .into_response(),
        }
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(e: E) -> AppError {
        AppError::InternalServerError(e.into())
    }
}

impl AppError {
    pub fn from(code: StatusCode, s: impl Into<Cow<'static, str>>) -> AppError {
        AppError::ResponseStatusError(code, s.into())
    }

    pub fn bad_request(s: impl Into<Cow<'static, str>>) -> AppError {
        AppError::from(StatusCode::BAD_REQUEST, s)
    }

    pub fn not_found(s: impl Into<Cow<'static, str>>) -> AppError {
        AppError::from(StatusCode::NOT_FOUND, s)
    }

    pub fn forbidden(s: impl Into<Cow<'static, str>>) -> AppError {
        AppError::from(StatusCode::FORBIDDEN, s)
    }

    pub fn conflict(s: impl Into<Cow<'static, str>>) -> AppError {
        AppError::from(StatusCode::CONFLICT, s)
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ResponseStatusError(code, _) => *code,
        }
    }
}

/// Turns a unique-index violation into a 409 with `message`; any other
/// database error stays internal. For inserts whose lookup-first duplicate
/// check can lose to a concurrent request.
pub fn on_unique_violation(
    message: &'static str,
) -> impl FnOnce(DieselError) -> AppError {
    move |e| match e {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
            AppError::conflict(message)
        }
        e => e.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(kind: DatabaseErrorKind) -> DieselError {
        DieselError::DatabaseError(kind, Box::new(String::from("join_requests_pending_key")))
    }

    #[test]
    fn unique_violations_become_conflicts() {
        let err = on_unique_violation("you already have a pending join request")(violation(
            DatabaseErrorKind::UniqueViolation,
        ));
        assert_eq!(err.status(), StatusCode::CONFLICT);
        match err {
            AppError::ResponseStatusError(_, message) => {
                assert_eq!(message, "you already have a pending join request")
            }
            other => panic!("expected a status error, got {other:?}"),
        }
    }

    #[test]
    fn other_database_errors_stay_internal() {
        let err = on_unique_violation("duplicate")(violation(
            DatabaseErrorKind::ForeignKeyViolation,
        ));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let err = on_unique_violation("duplicate")(DieselError::NotFound);
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn status_errors_keep_their_code() {
        let response = AppError::conflict("already a member").into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn foreign_errors_become_internal() {
        let err: AppError = "x".parse::<i32>().unwrap_err().into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            err.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
