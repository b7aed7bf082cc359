//! Notification fan-out.
//!
//! Every event is persisted as a `notifications` row per recipient, then
//! delivered best-effort over three channels: open websockets, Web Push
//! subscriptions, and (for a few events) email. Delivery happens on a
//! spawned task so handlers never wait for it or fail because of it.

use crate::{
    email::{Email, Mailer},
    models::{Notification, NotificationKind, PushSubscription, User},
    push::{Delivery, PushSender},
    schema::*,
    DbPool,
};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use itertools::Itertools;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

const SOCKET_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct SocketEvent {
    pub user_id: i32,
    pub payload: Arc<str>,
}

/// Broadcasts serialized notifications to every open websocket; each socket
/// keeps only the events addressed to its user.
#[derive(Clone)]
pub struct SocketHub {
    sender: broadcast::Sender<SocketEvent>,
}

impl Default for SocketHub {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(SOCKET_BUFFER);
        SocketHub { sender }
    }
}

impl SocketHub {
    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.sender.subscribe()
    }

    /// Returns how many sockets were listening.
    pub fn publish(&self, user_id: i32, payload: impl Into<Arc<str>>) -> usize {
        self.sender
            .send(SocketEvent {
                user_id,
                payload: payload.into(),
            })
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct Outgoing {
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub link: Option<String>,
    pub email: Option<Email>,
}

impl Outgoing {
    pub fn new(kind: NotificationKind, title: impl Into<String>, body: impl Into<String>) -> Self {
        Outgoing {
            kind,
            title: title.into(),
            body: body.into(),
            link: None,
            email: None,
        }
    }

    pub fn link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn email(mut self, email: Email) -> Self {
        self.email = Some(email);
        self
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SocketMessage<'a> {
    #[serde(rename = "type")]
    message_type: &'static str,
    notification: &'a Notification,
}

pub fn socket_payload(notification: &Notification) -> serde_json::Result<String> {
    serde_json::to_string(&SocketMessage {
        message_type: "notification",
        notification,
    })
}

pub struct Notifier {
    pool: DbPool,
    hub: SocketHub,
    push: Option<PushSender>,
    mailer: Option<Mailer>,
}

impl Notifier {
    pub fn new(
        pool: DbPool,
        hub: SocketHub,
        push: Option<PushSender>,
        mailer: Option<Mailer>,
    ) -> Arc<Notifier> {
        Arc::new(Notifier {
            pool,
            hub,
            push,
            mailer,
        })
    }

    pub fn hub(&self) -> &SocketHub {
        &self.hub
    }

    pub fn push_public_key(&self) -> Option<&str> {
        self.push.as_ref().and_then(|p| p.public_key())
    }

    /// Delivers in the background; failures are logged, never returned.
    pub fn dispatch(self: &Arc<Self>, recipients: Vec<i32>, outgoing: Outgoing) {
        let recipients: Vec<i32> = recipients.into_iter().unique().collect();
        if recipients.is_empty() {
            return;
        }

        let notifier = Arc::clone(self);
        tokio::spawn(async move {
            let kind = outgoing.kind;
            if let Err(e) = notifier.deliver(&recipients, outgoing).await {
                tracing::warn!(%kind, "notification delivery failed: {e:#}");
            }
        });
    }

    async fn deliver(&self, recipients: &[i32], outgoing: Outgoing) -> anyhow::Result<()> {
        #[derive(Insertable)]
        #[diesel(table_name = notifications)]
        struct NewNotification<'a> {
            user_id: i32,
            kind: &'a str,
            title: &'a str,
            body: &'a str,
            link: Option<&'a str>,
        }

        let conn = &mut self.pool.get().await?;

        let rows = recipients
            .iter()
            .map(|&user_id| NewNotification {
                user_id,
                kind: outgoing.kind.as_str(),
                title: &outgoing.title,
                body: &outgoing.body,
                link: outgoing.link.as_deref(),
            })
            .collect::<Vec<_>>();
        let saved = diesel::insert_into(notifications::table)
            .values(rows)
            .get_results::<Notification>(conn)
            .await?;

        for notification in &saved {
            self.hub
                .publish(notification.user_id, socket_payload(notification)?);
        }

        if let Some(push) = &self.push {
            let payload = serde_json::to_vec(&serde_json::json!({
                "title": outgoing.title,
                "body": outgoing.body,
                "link": outgoing.link,
            }))?;
            let subscriptions = push_subscriptions::table
                .filter(push_subscriptions::user_id.eq_any(recipients.to_vec()))
                .load::<PushSubscription>(conn)
                .await?;

            for subscription in subscriptions {
                let outcome = push.send(&subscription, &payload).await;
                settle_push(conn, &subscription, outcome).await;
            }
        }

        if let (Some(mailer), Some(email)) = (&self.mailer, &outgoing.email) {
            let users = users::table
                .filter(users::id.eq_any(recipients.to_vec()))
                .load::<User>(conn)
                .await?;

            for user in users {
                if let Err(e) = mailer.send(&user.name, &user.email, email).await {
                    tracing::warn!(user_id = user.id, "email failed: {e:#}");
                }
            }
        }

        Ok(())
    }
}

/// Acts on one push attempt. Never fails, so the remaining pushes and emails
/// still go out.
async fn settle_push(
    conn: &mut AsyncPgConnection,
    subscription: &PushSubscription,
    outcome: anyhow::Result<Delivery>,
) {
    match outcome {
        Ok(Delivery::Sent) => {}
        Ok(Delivery::Gone) => {
            let dropped = diesel::delete(push_subscriptions::table.find(subscription.id))
                .execute(conn)
                .await;
            if let Err(e) = dropped {
                tracing::warn!(
                    subscription_id = subscription.id,
                    "could not drop gone push subscription: {e:#}"
                );
            }
        }
        Err(e) => tracing::warn!(
            user_id = subscription.user_id,
            "web push failed: {e:#}"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::UserRole, test_db};
    use chrono::NaiveDateTime;

    fn notification(user_id: i32) -> Notification {
        Notification {
            id: 1,
            user_id,
            kind: NotificationKind::NewPost.as_str().to_string(),
            title: "New post".to_string(),
            body: "Robotics posted an update".to_string(),
            link: Some("/clubs/4".to_string()),
            read: false,
            created_at: NaiveDateTime::default(),
        }
    }

    #[tokio::test]
    async fn hub_delivers_to_every_listener() {
        let hub = SocketHub::default();
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        assert_eq!(hub.publish(3, "hello"), 2);

        let event = first.recv().await.unwrap();
        assert_eq!(event.user_id, 3);
        assert_eq!(&*event.payload, "hello");
        assert_eq!(second.recv().await.unwrap().user_id, 3);
    }

    #[test]
    fn publishing_without_listeners_is_harmless() {
        assert_eq!(SocketHub::default().publish(1, "nobody"), 0);
    }

    #[test]
    fn socket_payload_is_tagged() {
        let payload = socket_payload(&notification(9)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["type"], "notification");
        assert_eq!(value["notification"]["userId"], 9);
        assert_eq!(value["notification"]["kind"], "NEW_POST");
        assert_eq!(value["notification"]["read"], false);
    }

    #[test]
    fn outgoing_builder_sets_optional_parts() {
        let outgoing = Outgoing::new(NotificationKind::ClubApproved, "t", "b")
            .link("/clubs/1")
            .email(Email::club_approved("Ada", "Chess", "/clubs/1"));
        assert_eq!(outgoing.link.as_deref(), Some("/clubs/1"));
        assert!(outgoing.email.is_some());
    }

    async fn subscriptions_of(conn: &mut AsyncPgConnection, user_id: i32) -> i64 {
        push_subscriptions::table
            .filter(push_subscriptions::user_id.eq(user_id))
            .count()
            .get_result(conn)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn gone_subscriptions_are_dropped_and_delivery_goes_on() {
        let Some(mut conn) = test_db::connect().await else {
            return;
        };
        let conn = &mut conn;
        let user = test_db::user(conn, UserRole::Student).await;

        let subscription = diesel::insert_into(push_subscriptions::table)
            .values((
                push_subscriptions::user_id.eq(user.id),
                push_subscriptions::endpoint.eq(format!("https://push.example.com/{}", user.id)),
                push_subscriptions::p256dh.eq("BPk"),
                push_subscriptions::auth.eq("x9"),
            ))
            .get_result::<PushSubscription>(conn)
            .await
            .unwrap();

        settle_push(conn, &subscription, Err(anyhow::anyhow!("push service timed out"))).await;
        assert_eq!(subscriptions_of(conn, user.id).await, 1);

        settle_push(conn, &subscription, Ok(Delivery::Gone)).await;
        assert_eq!(subscriptions_of(conn, user.id).await, 0);

        // already gone: nothing to delete, nothing to fail
        settle_push(conn, &subscription, Ok(Delivery::Gone)).await;
    }
}
