use std::sync::Arc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};

use crate::exam::ExamServer;

/// Push-mode attachment to a channel: the connecting peer is joined with a
/// delivery handler feeding this socket, the server runs its poll loop, and
/// exam events for the channel ride along. Closing the socket leaves the
/// channel.
pub async fn handle_events_socket(
    mut websocket: WebSocket,
    server: Arc<ExamServer>,
    channel_id: String,
    peer_id: String,
) {
    if server.reserved_peer(&peer_id) {
        tracing::warn!(
            channel_id = %channel_id,
            peer_id = %peer_id,
            "Rejecting event socket for reserved peer id"
        );
        let _ = websocket.close().await;
        return;
    }

    tracing::info!(channel_id = %channel_id, peer_id = %peer_id, "Event socket connected");

    let (mut ws_sender, mut ws_receiver) = websocket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Bridge task so every producer below shares one sink
    let sender_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = ws_sender.send(message).await {
                tracing::debug!(error = %e, "Event socket send failed");
                break;
            }
        }
    });

    // Signaling delivery: join with a push handler, then poll on the
    // server's interval. Dedup lives in the channel manager, so this peer
    // sees each message id at most once.
    let (delivery_tx, mut delivery_rx) = mpsc::unbounded_channel();
    server
        .channels()
        .join_channel(&channel_id, &peer_id, delivery_tx)
        .await;

    let poll_task = {
        let server = server.clone();
        let channel_id = channel_id.clone();
        let peer_id = peer_id.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(server.poll_interval());
            loop {
                ticker.tick().await;
                server.channels().poll_messages(&channel_id, &peer_id).await;
                while let Ok(message) = delivery_rx.try_recv() {
                    match serde_json::to_string(&serde_json::json!({
                        "type": "signal",
                        "data": message,
                    })) {
                        Ok(text) => {
                            if tx.send(Message::text(text)).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to serialize signaling message");
                        }
                    }
                }
            }
        })
    };

    // Exam events scoped to this channel
    let events_task = {
        let mut events = server.subscribe_events();
        let channel_id = channel_id.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if event.exam_code() != channel_id {
                    continue;
                }
                match serde_json::to_string(&serde_json::json!({
                    "type": "exam_event",
                    "data": event,
                })) {
                    Ok(text) => {
                        if tx.send(Message::text(text)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialize exam event");
                    }
                }
            }
        })
    };

    // The socket is push-only; drain until the client goes away
    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(message) if message.is_close() => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "Event socket error");
                break;
            }
        }
    }

    server.leave_channel(&channel_id, &peer_id).await;
    poll_task.abort();
    events_task.abort();
    sender_task.abort();
    tracing::info!(channel_id = %channel_id, peer_id = %peer_id, "Event socket closed");
}
