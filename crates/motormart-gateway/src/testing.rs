//! In-process collaborators for router and session tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use motormart_db::Database;
use motormart_types::events::Frame;
use motormart_types::models::Notification;

use crate::config::RouterConfig;
use crate::push::{PushError, PushGateway};
use crate::registry::{ConnectionRegistry, Outbound};
use crate::router::MessageRouter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushMode {
    Succeed,
    Fail,
    Hang,
}

/// Reports every invocation on a channel, then behaves according to its mode.
pub struct RecordingPush {
    calls: mpsc::UnboundedSender<(String, Notification)>,
    mode: PushMode,
}

#[async_trait]
impl PushGateway for RecordingPush {
    async fn send_to_token(&self, token: &str, payload: &Notification) -> Result<String, PushError> {
        let _ = self.calls.send((token.to_string(), payload.clone()));
        match self.mode {
            PushMode::Succeed => Ok("push-1".to_string()),
            PushMode::Fail => Err(PushError::MissingId),
            PushMode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok("never".to_string())
            }
        }
    }
}

pub struct Harness {
    pub router: MessageRouter,
    pub db: Arc<Database>,
    pub push_calls: mpsc::UnboundedReceiver<(String, Notification)>,
}

pub fn harness(mode: PushMode) -> Harness {
    let config = RouterConfig {
        db_timeout: Duration::from_secs(2),
        write_timeout: Duration::from_millis(200),
        push_timeout: Duration::from_millis(200),
    };
    harness_with(mode, config)
}

pub fn harness_with(mode: PushMode, config: RouterConfig) -> Harness {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();
    let push = Arc::new(RecordingPush { calls: tx, mode });
    let router = MessageRouter::new(db.clone(), ConnectionRegistry::new(), push, config);
    Harness { router, db, push_calls: rx }
}

/// Drives a connection's outbound queue like a healthy socket writer:
/// acknowledges every frame and forwards it to the returned receiver.
pub fn healthy_client(mut outbound: mpsc::Receiver<Outbound>) -> mpsc::UnboundedReceiver<Frame> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(out) = outbound.recv().await {
            if let Some(ack) = out.ack {
                let _ = ack.send(());
            }
            if tx.send(out.frame).is_err() {
                break;
            }
        }
    });
    rx
}

pub async fn next_push(
    calls: &mut mpsc::UnboundedReceiver<(String, Notification)>,
) -> Option<(String, Notification)> {
    tokio::time::timeout(Duration::from_secs(2), calls.recv()).await.ok().flatten()
}
