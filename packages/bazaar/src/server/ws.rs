//! Chat websocket: handshake, then one dispatch loop per connection.

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use bazaar_chat::protocol::{
    Ack, ActivityNotification, ClientEvent, ClientFrame, ConversationRef, SendMessage,
    ServerEvent, ServerFrame, TypingStatus,
};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::AppState;
use super::hub::ConnectionId;

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let verdict = timeout(
        state.config.handshake_timeout,
        authenticate(&mut ws_receiver, &state),
    )
    .await;
    let user_id = match verdict {
        Ok(Ok(user_id)) => user_id,
        Ok(Err(reason)) => {
            state.metrics.handshake_rejected();
            info!(reason = %reason, "handshake rejected");
            if let Ok(json) = serde_json::to_string(&ServerFrame::Rejected { reason }) {
                let _ = ws_sender.send(WsMessage::Text(json.into())).await;
            }
            let _ = ws_sender.close().await;
            return;
        }
        Err(_) => {
            state.metrics.handshake_rejected();
            debug!("handshake timed out");
            let _ = ws_sender.close().await;
            return;
        }
    };

    let welcome = ServerFrame::Welcome {
        user_id: user_id.clone(),
    };
    match serde_json::to_string(&welcome) {
        Ok(json) => {
            if ws_sender.send(WsMessage::Text(json.into())).await.is_err() {
                return;
            }
        }
        Err(e) => {
            error!("Failed to serialize welcome: {}", e);
            return;
        }
    }

    let (tx, mut rx) = mpsc::channel::<ServerFrame>(state.config.send_channel_capacity);
    let conn = state.hub.register(&user_id, tx.clone()).await;
    state.metrics.connection_opened();
    info!(conn, user = %user_id, "chat connection established");

    // Task to send frames to the websocket
    let sender_task = async move {
        while let Some(frame) = rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize frame: {}", e);
                    continue;
                }
            };
            if ws_sender.send(WsMessage::Text(json.into())).await.is_err() {
                break;
            }
        }
    };

    // Task to handle incoming frames
    let input_state = state.clone();
    let input_user = user_id.clone();
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => {
                    input_state.metrics.frame_received();
                    match serde_json::from_str::<ClientFrame>(text.as_str()) {
                        Ok(frame) => dispatch(&input_state, conn, &input_user, frame, &tx).await,
                        Err(e) => {
                            input_state.metrics.frame_malformed();
                            warn!(conn, error = %e, "malformed client frame");
                        }
                    }
                }
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(conn, error = %e, "websocket receive error");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = sender_task => {}
        _ = input_task => {}
    }

    // Tell peers a connection that closed mid-typing has stopped.
    for room in state.hub.unregister(conn).await {
        let stop = ServerFrame::from(ServerEvent::PeerTyping(TypingStatus {
            conversation_id: room.clone(),
            is_typing: false,
        }));
        let delivery = state.hub.broadcast_room(&room, &stop, None).await;
        state.metrics.frames_dropped(delivery.dropped);
    }
    state.metrics.connection_closed();
    info!(conn, user = %user_id, "chat connection closed");
}

/// Wait for `hello` and resolve its token. Errors are the rejection reason.
async fn authenticate(
    receiver: &mut SplitStream<WebSocket>,
    state: &AppState,
) -> Result<String, String> {
    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        return match serde_json::from_str::<ClientFrame>(text.as_str()) {
            Ok(ClientFrame {
                event: ClientEvent::Hello { token },
                ..
            }) => state
                .auth
                .resolve(&token)
                .ok_or_else(|| "invalid token".to_string()),
            Ok(_) => Err("expected hello".to_string()),
            Err(_) => Err("malformed handshake".to_string()),
        };
    }
    Err("connection closed during handshake".to_string())
}

async fn dispatch(
    state: &AppState,
    conn: ConnectionId,
    user_id: &str,
    frame: ClientFrame,
    tx: &mpsc::Sender<ServerFrame>,
) {
    let ClientFrame { ack, event } = frame;
    match event {
        ClientEvent::Hello { .. } => debug!(conn, "hello after handshake ignored"),
        ClientEvent::JoinConversation(ConversationRef { conversation_id }) => {
            let reply = match state.store.check_participant(&conversation_id, user_id).await {
                Ok(()) => {
                    state.hub.join(conn, &conversation_id).await;
                    debug!(conn, conversation = %conversation_id, "joined room");
                    ack.map(|id| Ack::ok(id, None))
                }
                Err(e) => {
                    state.metrics.request_rejected();
                    debug!(conn, conversation = %conversation_id, reason = %e, "join rejected");
                    ack.map(|id| Ack::rejected(id, e.to_string()))
                }
            };
            reply_ack(tx, reply).await;
        }
        ClientEvent::LeaveConversation(ConversationRef { conversation_id }) => {
            state.hub.leave(conn, &conversation_id).await;
            debug!(conn, conversation = %conversation_id, "left room");
        }
        ClientEvent::SendMessage(send) => handle_send(state, conn, user_id, ack, send, tx).await,
        ClientEvent::TypingStatus(status) => {
            // Only members relay presence.
            if !state.hub.is_joined(conn, &status.conversation_id).await {
                return;
            }
            let room = status.conversation_id.clone();
            state.hub.set_typing(conn, &room, status.is_typing).await;
            let frame = ServerFrame::from(ServerEvent::PeerTyping(TypingStatus {
                conversation_id: status.conversation_id,
                is_typing: status.is_typing,
            }));
            let delivery = state.hub.broadcast_room(&room, &frame, Some(conn)).await;
            state.metrics.frames_dropped(delivery.dropped);
        }
    }
}

async fn handle_send(
    state: &AppState,
    conn: ConnectionId,
    user_id: &str,
    ack: Option<u64>,
    send: SendMessage,
    tx: &mpsc::Sender<ServerFrame>,
) {
    let SendMessage {
        conversation_id,
        content,
        kind,
        media_url,
    } = send;
    let appended = match state
        .store
        .append(&conversation_id, user_id, &content, kind, media_url)
        .await
    {
        Ok(appended) => appended,
        Err(e) => {
            state.metrics.request_rejected();
            debug!(conn, conversation = %conversation_id, reason = %e, "send rejected");
            reply_ack(tx, ack.map(|id| Ack::rejected(id, e.to_string()))).await;
            return;
        }
    };
    state.metrics.message_stored();
    let message = appended.message;
    debug!(conn, conversation = %conversation_id, message = %message.id, "message stored");

    // Ack first, so the sender resolves before its own echo arrives.
    reply_ack(tx, ack.map(|id| Ack::ok(id, Some(message.clone())))).await;

    let echo = ServerFrame::from(ServerEvent::NewMessage(message.clone()));
    let room = state.hub.broadcast_room(&conversation_id, &echo, None).await;

    let activity = ServerFrame::from(ServerEvent::ActivityNotification(ActivityNotification {
        conversation_id: conversation_id.clone(),
        message,
        unread_delta: 1,
    }));
    let outside = state
        .hub
        .notify_user_outside_room(&appended.recipient, &conversation_id, &activity)
        .await;
    state.metrics.frames_dropped(room.dropped + outside.dropped);
}

async fn reply_ack(tx: &mpsc::Sender<ServerFrame>, ack: Option<Ack>) {
    if let Some(ack) = ack {
        let _ = tx.send(ServerFrame::Ack(ack)).await;
    }
}
