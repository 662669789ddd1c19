use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use bytes::Bytes;
use futures_util::stream::SplitStream;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use motormart_types::events::{ClientCommand, Frame};
use motormart_types::models::UserId;

use crate::error::ChatError;
use crate::registry::{ConnectionHandle, Outbound};
use crate::router::MessageRouter;
use crate::session::{Opened, Session};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Serve one authenticated websocket until it closes. Identity was established
/// by the upgrade handler; this never parses credentials.
pub async fn handle_connection(socket: WebSocket, router: MessageRouter, user_id: UserId) {
    let (mut sender, receiver) = socket.split();

    let Opened {
        session,
        outbound,
        backlog,
    } = Session::open(&router, user_id).await;
    info!("user {} connected ({})", user_id, session.handle().id());

    let mut greeting = vec![Frame::ready(user_id)];
    greeting.extend(backlog.iter().map(Frame::new_message));

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_recv = pong_received.clone();

    let handle = session.handle().clone();
    let mut send_task = tokio::spawn(async move {
        pump_outbound(
            &mut sender,
            greeting,
            outbound,
            handle,
            pong_received,
            HEARTBEAT_INTERVAL,
        )
        .await;
    });

    let recv_router = router.clone();
    let own_handle = session.handle().clone();
    let mut recv_task = tokio::spawn(async move {
        read_loop(receiver, recv_router, own_handle, user_id, pong_flag_recv).await;
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    let was_current = session.close().await;
    info!(
        "user {} disconnected{}",
        user_id,
        if was_current { "" } else { " (superseded)" }
    );
}

/// Socket writer for one connection. Ready + backlog go out before the queue
/// is drained, so queued messages always precede live ones on the wire.
/// Returns when the handle is closed, the queue ends, the sink fails or two
/// heartbeats go unanswered.
async fn pump_outbound<S>(
    sink: &mut S,
    greeting: Vec<Frame>,
    mut outbound: mpsc::Receiver<Outbound>,
    handle: ConnectionHandle,
    pong_flag: Arc<AtomicBool>,
    heartbeat_every: Duration,
) where
    S: Sink<WsMessage> + Unpin,
{
    for frame in &greeting {
        if send_frame(sink, frame).await.is_err() {
            return;
        }
    }

    let mut heartbeat = tokio::time::interval(heartbeat_every);
    heartbeat.tick().await;
    let mut missed_heartbeats: u8 = 0;

    loop {
        tokio::select! {
            _ = handle.closed() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
            out = outbound.recv() => {
                let Some(out) = out else { break };
                // The router stopped waiting and fell back to push; the
                // message stays Sent and is flushed on the next connect.
                if out.ack.as_ref().is_some_and(|ack| ack.is_closed()) {
                    debug!("dropping abandoned {} frame for {}", out.frame.event, handle.id());
                    continue;
                }
                if send_frame(sink, &out.frame).await.is_err() {
                    break;
                }
                if let Some(ack) = out.ack {
                    let _ = ack.send(());
                }
            }
            _ = heartbeat.tick() => {
                if pong_flag.swap(false, Ordering::Acquire) {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= 2 {
                        warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                        break;
                    }
                }
                if sink.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn read_loop(
    mut receiver: SplitStream<WebSocket>,
    router: MessageRouter,
    own_handle: ConnectionHandle,
    user_id: UserId,
    pong_flag: Arc<AtomicBool>,
) {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            WsMessage::Text(text) => match serde_json::from_str::<ClientCommand>(text.as_str()) {
                Ok(cmd) => handle_command(&router, &own_handle, user_id, cmd).await,
                Err(e) => {
                    warn!(
                        "user {} bad frame: {} -- raw: {}",
                        user_id,
                        e,
                        text.as_str().chars().take(200).collect::<String>()
                    );
                    let reply = Frame::error("unrecognised frame");
                    if own_handle.queue(reply, router.config().write_timeout).await.is_err() {
                        break;
                    }
                }
            },
            WsMessage::Pong(_) => {
                pong_flag.store(true, Ordering::Release);
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
}

/// Commands from one connection are handled in arrival order, so a sender's
/// own messages are persisted in the order they were sent.
async fn handle_command(
    router: &MessageRouter,
    own_handle: &ConnectionHandle,
    user_id: UserId,
    cmd: ClientCommand,
) {
    match cmd {
        ClientCommand::SendMessage {
            recipient_id,
            message,
            kind,
        } => {
            // Routed in its own task: if this connection drops mid-send, the
            // recipient side of the delivery still runs to completion.
            let task_router = router.clone();
            let routed = tokio::spawn(async move {
                task_router.route(user_id, recipient_id, message, kind).await
            })
            .await;

            let reply = match routed.map_err(ChatError::from).and_then(|r| r) {
                Ok(routed) => {
                    debug!(
                        "user {} -> {}: message {} {:?}",
                        user_id, recipient_id, routed.message.id, routed.delivery
                    );
                    Frame::message_sent(&routed.message)
                }
                Err(e) if e.is_rejection() => Frame::error(e.to_string()),
                Err(e) => {
                    warn!("user {} -> {}: send failed: {}", user_id, recipient_id, e);
                    Frame::error("message was not accepted, please retry")
                }
            };
            if let Err(e) = own_handle.queue(reply, router.config().write_timeout).await {
                debug!("user {} did not get the send reply: {}", user_id, e);
            }
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<(), S::Error>
where
    S: Sink<WsMessage> + Unpin,
{
    sink.send(WsMessage::Text(frame.to_json().into())).await
}
