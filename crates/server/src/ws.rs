//! WebSocket handler for the live spread feed.
//!
//! On connect the client receives `{"type":"snapshot","data":[...]}` and
//! then one `{"type":"update","data":{...}}` per published spread.
//! Clients may send `{"type":"ping"}` and get `{"type":"pong"}` back.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::{debug, info};

use spread_hub::PushMessage;

use crate::server::AppState;

/// Client -> server message
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
}

/// WebSocket upgrade handler at GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn send(socket: &mut WebSocket, message: &PushMessage) -> bool {
    socket.send(Message::Text(message.to_json())).await.is_ok()
}

fn reply_to(text: &str) -> PushMessage {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Ping) => PushMessage::Pong,
        Err(_) => PushMessage::error("unknown message type"),
    }
}

async fn handle_ws(mut socket: WebSocket, state: AppState) {
    let (mut subscription, snapshot) = state.hub.register();
    let subscriber = subscription.id();
    info!(subscriber, tokens = snapshot.len(), "WebSocket client connected");

    if !send(&mut socket, &PushMessage::snapshot(&snapshot)).await {
        return;
    }

    loop {
        tokio::select! {
            update = subscription.recv() => match update {
                Some(record) => {
                    if !send(&mut socket, &PushMessage::update(&record)).await {
                        break;
                    }
                }
                // Unregistered by the hub (shutdown)
                None => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if !send(&mut socket, &reply_to(&text)).await {
                        break;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if socket.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!(subscriber, dropped = subscription.dropped(), "Subscriber queue closed");
    drop(subscription);
    info!(subscriber, "WebSocket client disconnected");
}
