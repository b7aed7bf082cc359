use crate::{
    auth::ExtractAuth,
    error::{AppError, AppResult},
    storage::{self, FileStore, StorageError},
};
use axum::{
    body::Bytes,
    extract::{Multipart, Path},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Serialize;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    key: String,
    url: String,
    mime_type: &'static str,
}

fn storage_error(e: StorageError) -> AppError {
    match e {
        StorageError::TooLarge(_) => AppError::from(StatusCode::PAYLOAD_TOO_LARGE, e.to_string()),
        StorageError::UnsupportedType => AppError::from(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "only images and PDF files can be uploaded",
        ),
        StorageError::Empty => AppError::bad_request(e.to_string()),
        StorageError::NotFound => AppError::not_found(e.to_string()),
        StorageError::Store(e) => AppError::InternalServerError(e.into()),
    }
}

fn bad_multipart(e: impl std::fmt::Display) -> AppError {
    AppError::bad_request(format!("malformed upload: {e}"))
}

/// Reads the first file field, stopping as soon as it passes `max_bytes`.
async fn read_file(multipart: &mut Multipart, max_bytes: usize) -> AppResult<Bytes> {
    while let Some(mut field) = multipart.next_field().await.map_err(bad_multipart)? {
        if field.file_name().is_none() {
            continue;
        }

        let mut data = Vec::new();
        while let Some(chunk) = field.chunk().await.map_err(bad_multipart)? {
            if data.len() + chunk.len() > max_bytes {
                return Err(storage_error(StorageError::TooLarge(max_bytes)));
            }
            data.extend_from_slice(&chunk);
        }
        return Ok(Bytes::from(data));
    }
    Err(AppError::bad_request("no file was uploaded"))
}

async fn upload(
    ExtractAuth(claims): ExtractAuth,
    Extension(files): Extension<FileStore>,
    mut multipart: Multipart,
) -> AppResult<Json<UploadResponse>> {
    let data = read_file(&mut multipart, files.max_bytes()).await?;
    let stored = files.put(data).await.map_err(storage_error)?;
    tracing::info!(user_id = claims.user_id, key = %stored.key, "file uploaded");

    Ok(Json(UploadResponse {
        url: storage::proxy_url(&stored.key),
        key: stored.key,
        mime_type: stored.mime_type,
    }))
}

async fn download(
    Extension(files): Extension<FileStore>,
    Path(key): Path<String>,
) -> AppResult<impl IntoResponse> {
    let (data, mime_type) = files
        .get(key.trim_start_matches('/'))
        .await
        .map_err(storage_error)?;

    Ok((
        [
            (header::CONTENT_TYPE, mime_type),
            // keys are content hashes, so a stored file never changes
            (
                header::CACHE_CONTROL,
                "public, max-age=31536000, immutable".to_string(),
            ),
        ],
        data,
    ))
}

pub fn app() -> Router {
    Router::new()
        .route("/upload", post(upload))
        .route("/files/*key", get(download))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_client_statuses() {
        assert_eq!(
            storage_error(StorageError::TooLarge(10)).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            storage_error(StorageError::UnsupportedType).status(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            storage_error(StorageError::Empty).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            storage_error(StorageError::NotFound).status(),
            StatusCode::NOT_FOUND
        );
    }
}
