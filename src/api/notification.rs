use crate::{
    auth::{ExtractAuth, QueryAuth},
    error::{AppError, AppResult},
    models::Notification,
    notify::{Notifier, SocketEvent},
    schema::*,
    DbPool,
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path,
    },
    response::Response,
    routing::{get, post},
    Extension, Json, Router,
};
use diesel::{prelude::*, upsert::excluded};
use diesel_async::RunQueryDsl;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

/// Most recent notifications returned by the listing.
const PAGE_SIZE: i64 = 100;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnreadCount {
    count: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PushKey {
    public_key: String,
}

#[derive(Deserialize)]
struct SubscriptionKeys {
    p256dh: String,
    auth: String,
}

/// The browser's `PushSubscription.toJSON()` shape.
#[derive(Deserialize)]
struct SubscribeRequest {
    endpoint: String,
    keys: SubscriptionKeys,
}

#[derive(Deserialize)]
struct UnsubscribeRequest {
    endpoint: String,
}

async fn list_notifications(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
) -> AppResult<Json<Vec<Notification>>> {
    let conn = &mut pool.get().await?;

    let notifications = notifications::table
        .filter(notifications::user_id.eq(claims.user_id))
        .order((notifications::created_at.desc(), notifications::id.desc()))
        .limit(PAGE_SIZE)
        .load::<Notification>(conn)
        .await?;

    Ok(Json(notifications))
}

async fn unread_count(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
) -> AppResult<Json<UnreadCount>> {
    let conn = &mut pool.get().await?;

    let count = notifications::table
        .filter(notifications::user_id.eq(claims.user_id))
        .filter(notifications::read.eq(false))
        .count()
        .get_result::<i64>(conn)
        .await?;

    Ok(Json(UnreadCount { count }))
}

async fn mark_read(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Path(id): Path<i32>,
) -> AppResult<Json<Notification>> {
    let conn = &mut pool.get().await?;

    // Someone else's notification looks the same as a missing one.
    let notification = diesel::update(
        notifications::table
            .filter(notifications::id.eq(id))
            .filter(notifications::user_id.eq(claims.user_id)),
    )
    .set(notifications::read.eq(true))
    .get_result::<Notification>(conn)
    .await
    .optional()?
    .ok_or_else(|| AppError::not_found("the notification does not exist"))?;

    Ok(Json(notification))
}

async fn mark_all_read(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
) -> AppResult<Json<UnreadCount>> {
    let conn = &mut pool.get().await?;

    diesel::update(
        notifications::table
            .filter(notifications::user_id.eq(claims.user_id))
            .filter(notifications::read.eq(false)),
    )
    .set(notifications::read.eq(true))
    .execute(conn)
    .await?;

    Ok(Json(UnreadCount { count: 0 }))
}

async fn push_key(Extension(notifier): Extension<Arc<Notifier>>) -> AppResult<Json<PushKey>> {
    let public_key = notifier
        .push_public_key()
        .ok_or_else(|| AppError::not_found("push notifications are not enabled"))?;

    Ok(Json(PushKey {
        public_key: public_key.to_string(),
    }))
}

async fn subscribe(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Json(req): Json<SubscribeRequest>,
) -> AppResult<Json<()>> {
    #[derive(Insertable)]
    #[diesel(table_name = push_subscriptions)]
    struct NewSubscription {
        user_id: i32,
        endpoint: String,
        p256dh: String,
        auth: String,
    }

    if !req.endpoint.starts_with("https://") {
        return Err(AppError::bad_request("push endpoint must be an https URL"));
    }

    let conn = &mut pool.get().await?;

    // An endpoint belongs to one browser; whoever subscribed last owns it.
    diesel::insert_into(push_subscriptions::table)
        .values(NewSubscription {
            user_id: claims.user_id,
            endpoint: req.endpoint,
            p256dh: req.keys.p256dh,
            auth: req.keys.auth,
        })
        .on_conflict(push_subscriptions::endpoint)
        .do_update()
        .set((
            push_subscriptions::user_id.eq(excluded(push_subscriptions::user_id)),
            push_subscriptions::p256dh.eq(excluded(push_subscriptions::p256dh)),
            push_subscriptions::auth.eq(excluded(push_subscriptions::auth)),
        ))
        .execute(conn)
        .await?;

    Ok(Json(()))
}

async fn unsubscribe(
    ExtractAuth(claims): ExtractAuth,
    Extension(pool): Extension<DbPool>,
    Json(req): Json<UnsubscribeRequest>,
) -> AppResult<Json<()>> {
    let conn = &mut pool.get().await?;

    diesel::delete(
        push_subscriptions::table
            .filter(push_subscriptions::endpoint.eq(req.endpoint))
            .filter(push_subscriptions::user_id.eq(claims.user_id)),
    )
    .execute(conn)
    .await?;

    Ok(Json(()))
}

async fn socket(
    QueryAuth(claims): QueryAuth,
    Extension(notifier): Extension<Arc<Notifier>>,
    ws: WebSocketUpgrade,
) -> Response {
    let events = notifier.hub().subscribe();
    ws.on_upgrade(move |socket| stream_notifications(socket, claims.user_id, events))
}

async fn stream_notifications(
    mut socket: WebSocket,
    user_id: i32,
    mut events: broadcast::Receiver<SocketEvent>,
) {
    let connection = nanoid!(10);
    tracing::debug!(user_id, %connection, "socket opened");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) if event.user_id == user_id => {
                    if socket.send(Message::Text(event.payload.to_string())).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(user_id, %connection, skipped, "socket fell behind");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::debug!(user_id, %connection, "socket closed");
}

pub fn app() -> Router {
    Router::new()
        .route("/notifications", get(list_notifications))
        .route("/notifications/unread-count", get(unread_count))
        .route("/notifications/read/:id", post(mark_read))
        .route("/notifications/read-all", post(mark_all_read))
        .route("/push/key", get(push_key))
        .route("/push/subscribe", post(subscribe))
        .route("/push/unsubscribe", post(unsubscribe))
        .route("/ws", get(socket))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriptions_deserialize_from_browser_json() {
        let req: SubscribeRequest = serde_json::from_str(
            r#"{"endpoint":"https://push.example.com/abc","expirationTime":null,"keys":{"p256dh":"BPk","auth":"x9"}}"#,
        )
        .unwrap();
        assert_eq!(req.endpoint, "https://push.example.com/abc");
        assert_eq!(req.keys.p256dh, "BPk");
        assert_eq!(req.keys.auth, "x9");
    }
}
