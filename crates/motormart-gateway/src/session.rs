use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use motormart_types::models::{Message, UserId};

use crate::registry::{ConnectionHandle, Outbound};
use crate::router::MessageRouter;

/// Frames buffered per connection before live writes start timing out.
pub const OUTBOUND_BUFFER: usize = 64;

/// A user's live session, from identity established until the transport closes.
pub struct Session {
    user_id: UserId,
    handle: ConnectionHandle,
    router: MessageRouter,
    online_since: Option<DateTime<Utc>>,
}

/// What a freshly opened session hands to its transport loop.
pub struct Opened {
    pub session: Session,
    pub outbound: mpsc::Receiver<Outbound>,
    /// Messages that arrived while the user was offline, now marked
    /// `Delivered`, ascending by id. Write these before anything else.
    pub backlog: Vec<Message>,
}

impl Session {
    /// Connecting -> Online: register the connection (superseding any older
    /// one), mark the user online and flush the undelivered backlog.
    pub async fn open(router: &MessageRouter, user_id: UserId) -> Opened {
        let (handle, outbound) = ConnectionHandle::new(OUTBOUND_BUFFER);

        if let Some(old) = router.registry().register(user_id, handle.clone()) {
            info!("user {} reconnected, closing connection {}", user_id, old.id());
        }

        let online_since = match router.run_db(move |db| db.set_online(user_id)).await {
            Ok(at) => Some(at),
            Err(e) => {
                warn!("failed to mark user {} online: {}", user_id, e);
                None
            }
        };

        // On failure the messages stay Sent and are flushed on the next connect.
        let backlog = match router.run_db(move |db| db.mark_delivered_for_recipient(user_id)).await {
            Ok(backlog) => backlog,
            Err(e) => {
                warn!("failed to flush backlog for user {}: {}", user_id, e);
                Vec::new()
            }
        };
        if !backlog.is_empty() {
            info!("flushing {} queued messages to user {}", backlog.len(), user_id);
        }

        Opened {
            session: Session {
                user_id,
                handle,
                router: router.clone(),
                online_since,
            },
            outbound,
            backlog,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Online -> Offline. Only the user's current connection updates presence;
    /// a connection superseded by a newer one leaves both registry and
    /// presence to its successor. A successor that registers after our
    /// unregister has already written a newer online time, which the offline
    /// write will not override. Returns whether this was the current one.
    pub async fn close(self) -> bool {
        self.handle.close();
        let user_id = self.user_id;

        if !self.router.registry().unregister(user_id, &self.handle) {
            debug!("connection {} for user {} was superseded", self.handle.id(), user_id);
            return false;
        }

        let offline = match self.online_since {
            Some(since) => self.router.run_db(move |db| db.set_offline_since(user_id, since)).await,
            None if self.router.registry().is_online(user_id) => Ok(false),
            None => self.router.run_db(move |db| db.set_offline(user_id)).await.map(|()| true),
        };
        match offline {
            Ok(true) => {}
            Ok(false) => debug!("user {} came back online before connection {} closed", user_id, self.handle.id()),
            Err(e) => warn!("failed to mark user {} offline: {}", user_id, e),
        }
        true
    }
}
