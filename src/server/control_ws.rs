//! Control-plane WebSocket (`/control`, C9, spec §4.9).
//!
//! Clients subscribe to all session lifecycle events and may send
//! `{type}`-tagged commands (`initiate_call`, `speak`, `hangup`). Grounded
//! on the teacher's `handle_websocket` loop (`src/server/mod.rs`):
//! `ws.recv()`/`ws.send()` driven by a `tokio::select!` against a broadcast
//! subscription.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::Deserialize;
use uuid::Uuid;

use crate::session::{ServerMessage, SessionEvent};

use super::ServerState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    InitiateCall {
        #[serde(rename = "phoneNumber")]
        to: String,
        goal: String,
        #[serde(default)]
        context: String,
    },
    Speak {
        #[serde(rename = "callId")]
        call_id: Uuid,
        text: String,
    },
    Hangup {
        #[serde(rename = "callId")]
        call_id: Uuid,
    },
}

pub async fn control_ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(|socket| handle_control_socket(socket, state))
}

async fn handle_control_socket(mut socket: WebSocket, state: ServerState) {
    let mut broadcast_rx = state.control_broadcast.subscribe();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&text, &state).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            event = broadcast_rx.recv() => {
                match event {
                    Ok(message) => {
                        let payload = serde_json::to_string(&message).unwrap_or_default();
                        if socket.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

async fn handle_client_message(text: &str, state: &ServerState) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(m) => m,
        Err(e) => {
            let _ = state.control_broadcast.send(ServerMessage::Error {
                call_id: None,
                message: format!("unrecognized control message: {e}"),
            });
            return;
        }
    };

    match message {
        ClientMessage::InitiateCall { to, goal, context } => {
            if let Err(e) = super::http::originate_call(state, &to, &goal, &context).await {
                let _ = state.control_broadcast.send(ServerMessage::Error { call_id: None, message: e });
            }
        }
        ClientMessage::Speak { call_id, text } => {
            let sessions = state.sessions.lock().await;
            if let Some(handle) = sessions.get(&call_id) {
                let _ = handle.events_tx.send(SessionEvent::ControlSpeak(text));
            }
        }
        ClientMessage::Hangup { call_id } => {
            let sessions = state.sessions.lock().await;
            if let Some(handle) = sessions.get(&call_id) {
                let _ = handle.events_tx.send(SessionEvent::ControlHangup);
            }
        }
    }
}
