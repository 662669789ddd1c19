use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::Utc;
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use motormart_db::Database;
use motormart_types::api::BroadcastResponse;
use motormart_types::events::Frame;
use motormart_types::models::{Message, MessageKind, MessageStatus, Notification, UserId};

use crate::config::RouterConfig;
use crate::error::ChatError;
use crate::push::PushGateway;
use crate::registry::ConnectionRegistry;

// Admission states of a persist transaction.
const WAITING: u8 = 0;
const STARTED: u8 = 1;
const ABANDONED: u8 = 2;

/// Longest accepted message body, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4000;

/// Where a persisted message ended up after one router pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the recipient's live connection and marked `Delivered`.
    Live,
    /// Recipient unreachable; stays `Sent` until their next connect. A push
    /// notification was attempted in the background.
    PendingPush,
}

#[derive(Debug, Clone)]
pub struct Routed {
    pub message: Message,
    pub delivery: Delivery,
}

/// Persists inbound messages and routes them to a live connection or to the
/// push fallback.
#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    db: Arc<Database>,
    registry: ConnectionRegistry,
    push: Arc<dyn PushGateway>,
    config: RouterConfig,
}

impl MessageRouter {
    pub fn new(
        db: Arc<Database>,
        registry: ConnectionRegistry,
        push: Arc<dyn PushGateway>,
        config: RouterConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                db,
                registry,
                push,
                config,
            }),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    /// Runs a blocking store call off the async runtime, bounded by the store deadline.
    pub async fn run_db<F, T>(&self, f: F) -> Result<T, ChatError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.inner.db.clone();
        let deadline = self.inner.config.db_timeout;
        let task = tokio::task::spawn_blocking(move || f(&db));
        match tokio::time::timeout(deadline, task).await {
            Ok(joined) => Ok(joined??),
            Err(_) => Err(ChatError::Timeout(deadline)),
        }
    }

    /// Steps 1 and 2 of a send. The store deadline covers the wait for the
    /// connection only: a transaction that has begun runs to completion and
    /// its outcome is reported, so `ChatError::Timeout` means nothing was written.
    async fn persist(
        &self,
        sender_id: UserId,
        recipient_id: UserId,
        body: String,
        kind: MessageKind,
    ) -> Result<Message, ChatError> {
        let db = self.inner.db.clone();
        let deadline = self.inner.config.db_timeout;
        let admission = Arc::new(AtomicU8::new(WAITING));
        let gate = admission.clone();

        let mut task = tokio::task::spawn_blocking(move || {
            let begin = || {
                gate.compare_exchange(WAITING, STARTED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            };
            db.persist_message_if(begin, sender_id, recipient_id, &body, kind, Utc::now())
        });

        let persisted = match tokio::time::timeout(deadline, &mut task).await {
            Ok(joined) => joined??,
            Err(_) => {
                if admission
                    .compare_exchange(WAITING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Err(ChatError::Timeout(deadline));
                }
                debug!("persist for {} -> {} began before the deadline, awaiting commit", sender_id, recipient_id);
                task.await??
            }
        };
        persisted.ok_or(ChatError::Timeout(deadline))
    }

    /// One inbound 1:1 message. Returns once the message is durable; the
    /// result says whether it reached a live connection.
    pub async fn route(
        &self,
        sender_id: UserId,
        recipient_id: UserId,
        body: String,
        kind: MessageKind,
    ) -> Result<Routed, ChatError> {
        validate(sender_id, recipient_id, &body)?;

        let mut message = self.persist(sender_id, recipient_id, body, kind).await?;
        debug!(
            "message {} persisted in conversation {} ({} -> {})",
            message.id, message.conversation_id, sender_id, recipient_id
        );

        if self.deliver_live(recipient_id, Frame::new_message(&message)).await {
            let id = message.id;
            match self.run_db(move |db| db.mark_delivered(id)).await {
                // false: a reconnect flushed it between the write and now
                Ok(_) => message.status = MessageStatus::Delivered,
                Err(e) => warn!("message {} written live but not marked delivered: {}", id, e),
            }
            return Ok(Routed {
                message,
                delivery: Delivery::Live,
            });
        }

        self.spawn_push(recipient_id, Notification::for_message(&message));
        Ok(Routed {
            message,
            delivery: Delivery::PendingPush,
        })
    }

    /// Fans an admin announcement out to `recipients`: live where connected,
    /// push otherwise. Broadcasts are not stored as 1:1 conversations.
    pub async fn broadcast(
        &self,
        sender_id: UserId,
        recipients: Vec<UserId>,
        body: &str,
        kind: MessageKind,
    ) -> BroadcastResponse {
        let frame = Frame::broadcast(sender_id, body, kind);
        let targets: Vec<UserId> = recipients.into_iter().filter(|id| *id != sender_id).collect();

        let outcomes = join_all(targets.iter().map(|&user_id| {
            let frame = frame.clone();
            async move { (user_id, self.deliver_live(user_id, frame).await) }
        }))
        .await;

        let mut report = BroadcastResponse {
            recipients: targets.len(),
            ..Default::default()
        };
        for (user_id, live) in outcomes {
            if live {
                report.live += 1;
            } else {
                self.spawn_push(user_id, Notification::for_broadcast(body));
                report.pushed += 1;
            }
        }

        info!(
            "broadcast from {}: {} recipients, {} live, {} push",
            sender_id, report.recipients, report.live, report.pushed
        );
        report
    }

    /// Broadcast to every user holding `role`, as resolved by the profile store.
    pub async fn broadcast_to_role(
        &self,
        sender_id: UserId,
        role: &str,
        body: &str,
        kind: MessageKind,
    ) -> Result<BroadcastResponse, ChatError> {
        if body.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let role_owned = role.to_string();
        let recipients = self.run_db(move |db| db.user_ids_with_role(&role_owned)).await?;
        Ok(self.broadcast(sender_id, recipients, body, kind).await)
    }

    /// Writes to the user's live connection, if any. Any failure counts as unreachable.
    async fn deliver_live(&self, user_id: UserId, frame: Frame) -> bool {
        let Some(handle) = self.inner.registry.lookup(user_id) else {
            return false;
        };

        match handle.write(frame, self.inner.config.write_timeout).await {
            Ok(()) => true,
            Err(e) => {
                warn!("live write to user {} failed ({}), falling back to push", user_id, e);
                false
            }
        }
    }

    /// Detached push attempt. Failures and timeouts are logged; nothing awaits the result.
    fn spawn_push(&self, user_id: UserId, notification: Notification) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let deadline = inner.config.push_timeout;
            match tokio::time::timeout(deadline, push_to_user(&inner, user_id, &notification)).await {
                Ok(Ok(Some(id))) => debug!("push to user {} accepted as {}", user_id, id),
                Ok(Ok(None)) => debug!("user {} has no device token, skipping push", user_id),
                Ok(Err(e)) => warn!("push to user {} failed: {:#}", user_id, e),
                Err(_) => warn!("push to user {} timed out after {:?}", user_id, deadline),
            }
        });
    }
}

async fn push_to_user(
    inner: &RouterInner,
    user_id: UserId,
    notification: &Notification,
) -> anyhow::Result<Option<String>> {
    let db = inner.db.clone();
    let token = tokio::task::spawn_blocking(move || db.get_device_token(user_id)).await??;
    let Some(token) = token else {
        return Ok(None);
    };
    let id = inner.push.send_to_token(&token, notification).await?;
    Ok(Some(id))
}

fn validate(sender_id: UserId, recipient_id: UserId, body: &str) -> Result<(), ChatError> {
    if sender_id == recipient_id {
        return Err(ChatError::SelfMessage);
    }
    if body.trim().is_empty() {
        return Err(ChatError::EmptyMessage);
    }
    if body.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ChatError::TooLong(MAX_MESSAGE_CHARS));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::registry::ConnectionHandle;
    use crate::testing::{PushMode, harness, harness_with, healthy_client, next_push};

    #[tokio::test]
    async fn offline_first_contact_persists_and_pushes() {
        let mut h = harness(PushMode::Succeed);
        h.db.set_device_token(2, "device-2").unwrap();

        let routed = h.router.route(1, 2, "hi".into(), MessageKind::Text).await.unwrap();
        assert_eq!(routed.delivery, Delivery::PendingPush);
        assert_eq!(routed.message.status, MessageStatus::Sent);

        let conv = h.db.get_conversation(routed.message.conversation_id).unwrap().unwrap();
        assert_eq!((conv.user_a, conv.user_b), (1, 2));
        let stored = h.db.get_messages(conv.id, i64::MAX, 20).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, MessageStatus::Sent);

        let (token, notification) = next_push(&mut h.push_calls).await.unwrap();
        assert_eq!(token, "device-2");
        assert_eq!(notification.body, "hi");
        assert_eq!(notification.message_id, Some(routed.message.id));
    }

    #[tokio::test]
    async fn online_recipient_gets_live_delivery_without_push() {
        let mut h = harness(PushMode::Succeed);
        h.db.set_device_token(2, "device-2").unwrap();
        let (handle, outbound) = ConnectionHandle::new(8);
        h.router.registry().register(2, handle);
        let mut frames = healthy_client(outbound);

        let routed = h.router.route(1, 2, "ping".into(), MessageKind::Text).await.unwrap();
        assert_eq!(routed.delivery, Delivery::Live);
        assert_eq!(routed.message.status, MessageStatus::Delivered);
        assert_eq!(
            h.db.get_message(routed.message.id).unwrap().unwrap().status,
            MessageStatus::Delivered
        );

        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.event, "new_message");
        assert_eq!(frame.data.unwrap()["message"], "ping");

        assert!(
            tokio::time::timeout(Duration::from_millis(100), h.push_calls.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn stalled_socket_falls_back_to_push() {
        let mut h = harness(PushMode::Succeed);
        h.db.set_device_token(2, "device-2").unwrap();
        // receiver kept alive but never drained or acked
        let (handle, _outbound) = ConnectionHandle::new(8);
        h.router.registry().register(2, handle);

        let routed = h.router.route(1, 2, "anyone?".into(), MessageKind::Text).await.unwrap();
        assert_eq!(routed.delivery, Delivery::PendingPush);
        assert_eq!(h.db.get_message(routed.message.id).unwrap().unwrap().status, MessageStatus::Sent);
        assert!(next_push(&mut h.push_calls).await.is_some());
    }

    #[tokio::test]
    async fn push_failure_does_not_fail_the_send() {
        let mut h = harness(PushMode::Fail);
        h.db.set_device_token(2, "device-2").unwrap();

        let routed = h.router.route(1, 2, "hi".into(), MessageKind::Text).await.unwrap();
        assert_eq!(routed.delivery, Delivery::PendingPush);
        assert!(next_push(&mut h.push_calls).await.is_some());
        assert!(h.db.get_message(routed.message.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn hanging_push_never_blocks_the_router() {
        let mut h = harness(PushMode::Hang);
        h.db.set_device_token(2, "device-2").unwrap();

        let started = std::time::Instant::now();
        for i in 0..3 {
            h.router.route(1, 2, format!("m{i}"), MessageKind::Text).await.unwrap();
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(next_push(&mut h.push_calls).await.is_some());
    }

    #[tokio::test]
    async fn missing_device_token_skips_push() {
        let mut h = harness(PushMode::Succeed);
        h.router.route(1, 2, "hi".into(), MessageKind::Text).await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(100), h.push_calls.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn invalid_sends_are_rejected_before_persistence() {
        let h = harness(PushMode::Succeed);
        assert!(matches!(
            h.router.route(1, 1, "me".into(), MessageKind::Text).await,
            Err(ChatError::SelfMessage)
        ));
        assert!(matches!(
            h.router.route(1, 2, "   ".into(), MessageKind::Text).await,
            Err(ChatError::EmptyMessage)
        ));
        let long = "a".repeat(MAX_MESSAGE_CHARS + 1);
        assert!(matches!(
            h.router.route(1, 2, long, MessageKind::Text).await,
            Err(ChatError::TooLong(_))
        ));
        assert!(h.db.list_conversations(1).unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_timeout_leaves_no_message_behind() {
        let h = harness_with(
            PushMode::Succeed,
            RouterConfig {
                db_timeout: Duration::from_millis(50),
                ..RouterConfig::default()
            },
        );

        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let db = h.db.clone();
        let holder = std::thread::spawn(move || {
            db.with_conn(|_| {
                locked_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            })
            .unwrap();
        });
        locked_rx.recv().unwrap();

        let res = h.router.route(1, 2, "late".into(), MessageKind::Text).await;
        assert!(matches!(res, Err(ChatError::Timeout(_))));

        holder.join().unwrap();
        // the abandoned persist gets the connection now and must decline it
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.db.list_conversations(1).unwrap().is_empty());

        let retried = h.router.route(1, 2, "late".into(), MessageKind::Text).await.unwrap();
        let stored = h.db.get_messages(retried.message.conversation_id, i64::MAX, 20).unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_senders_share_one_ordered_conversation() {
        let h = harness(PushMode::Succeed);
        let mut tasks = Vec::new();
        for i in 0..20 {
            let router = h.router.clone();
            let (from, to) = if i % 2 == 0 { (1, 2) } else { (2, 1) };
            tasks.push(tokio::spawn(async move {
                router.route(from, to, format!("m{i}"), MessageKind::Text).await.unwrap()
            }));
        }
        let mut routed = Vec::new();
        for t in tasks {
            routed.push(t.await.unwrap());
        }

        let conv = routed[0].message.conversation_id;
        assert!(routed.iter().all(|r| r.message.conversation_id == conv));
        assert_eq!(h.db.list_conversations(1).unwrap().len(), 1);

        let ids: Vec<i64> = h
            .db
            .get_messages(conv, i64::MAX, 100)
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids.len(), 20);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn broadcast_splits_live_and_push() {
        let mut h = harness(PushMode::Succeed);
        h.db.upsert_user(1, "Admin", "admin").unwrap();
        h.db.upsert_user(2, "Dealer A", "dealer").unwrap();
        h.db.upsert_user(3, "Dealer B", "dealer").unwrap();
        h.db.upsert_user(4, "Buyer", "user").unwrap();
        h.db.set_device_token(3, "device-3").unwrap();

        let (handle, outbound) = ConnectionHandle::new(8);
        h.router.registry().register(2, handle);
        let mut frames = healthy_client(outbound);

        let report = h
            .router
            .broadcast_to_role(1, "dealer", "Fees change on Monday", MessageKind::Text)
            .await
            .unwrap();
        assert_eq!(report, BroadcastResponse { recipients: 2, live: 1, pushed: 1 });

        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.event, "broadcast");
        assert_eq!(frame.message.as_deref(), Some("Fees change on Monday"));

        let (token, notification) = next_push(&mut h.push_calls).await.unwrap();
        assert_eq!(token, "device-3");
        assert_eq!(notification.title, "Announcement");

        assert!(h.db.list_conversations(2).unwrap().is_empty());
    }

    #[tokio::test]
    async fn broadcast_skips_the_sender() {
        let h = harness(PushMode::Succeed);
        let report = h.router.broadcast(1, vec![1, 5], "hello", MessageKind::Text).await;
        assert_eq!(report.recipients, 1);
        assert_eq!(report.pushed, 1);
    }
}
