use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use motormart_types::events::Frame;
use motormart_types::models::UserId;

use crate::error::DeliveryError;

/// A frame queued for a connection's socket writer. When `ack` is present the
/// writer signals it once the frame has been written to the socket.
#[derive(Debug)]
pub struct Outbound {
    pub frame: Frame,
    pub ack: Option<oneshot::Sender<()>>,
}

/// Handle to one live transport. Cloning shares the same connection;
/// equality is by connection id.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::Sender<Outbound>,
    closed: CancellationToken,
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

impl ConnectionHandle {
    /// Creates a handle plus the receiver the socket writer drains.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(buffer);
        let handle = Self {
            id: Uuid::new_v4(),
            tx,
            closed: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Asks the connection to shut down. Pending writes on this handle fail with
    /// [`DeliveryError::Closed`]; nothing else is affected.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// Writes a frame and waits until the socket writer confirms it, bounded by `deadline`.
    pub async fn write(&self, frame: Frame, deadline: Duration) -> Result<(), DeliveryError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let outbound = Outbound {
            frame,
            ack: Some(ack_tx),
        };

        let write = async {
            self.tx.send(outbound).await.map_err(|_| DeliveryError::Closed)?;
            ack_rx.await.map_err(|_| DeliveryError::Closed)
        };

        tokio::select! {
            _ = self.closed.cancelled() => Err(DeliveryError::Closed),
            res = tokio::time::timeout(deadline, write) => {
                res.unwrap_or(Err(DeliveryError::TimedOut))
            }
        }
    }

    /// Queues a frame without waiting for the socket writer to confirm it.
    /// Waits at most `deadline` for room in the buffer.
    pub async fn queue(&self, frame: Frame, deadline: Duration) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        let outbound = Outbound { frame, ack: None };
        match tokio::time::timeout(deadline, self.tx.send(outbound)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DeliveryError::Closed),
            Err(_) => Err(DeliveryError::TimedOut),
        }
    }
}

/// Live connections keyed by user. Sharded map: operations on different users
/// never contend on a common lock.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<UserId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `handle` the only live connection for `user_id`. A different
    /// handle already registered for the user is closed before it is replaced
    /// and returned.
    pub fn register(&self, user_id: UserId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        match self.connections.entry(user_id) {
            Entry::Occupied(mut entry) => {
                if *entry.get() == handle {
                    return None;
                }
                entry.get().close();
                Some(entry.insert(handle))
            }
            Entry::Vacant(entry) => {
                entry.insert(handle);
                None
            }
        }
    }

    /// Removes the entry only if it still holds `handle`. Returns whether it did,
    /// i.e. whether `handle` was the user's current connection.
    pub fn unregister(&self, user_id: UserId, handle: &ConnectionHandle) -> bool {
        self.connections
            .remove_if(&user_id, |_, current| current == handle)
            .is_some()
    }

    pub fn lookup(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.connections.get(&user_id).map(|entry| entry.value().clone())
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.connections.contains_key(&user_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
