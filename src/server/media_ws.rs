//! Telephony media-stream WebSocket (C9, spec §4.9).
//!
//! The provider does not carry `callId` in the URL query, so this handler
//! waits for the first `start` frame, extracts `callId` from its named
//! parameters, looks up the session, and hands ownership of inbound/outbound
//! audio over to it. If no session matches, the socket is closed with a
//! policy violation close code. Grounded on the teacher's
//! `handle_voice_session` loop shape (`src/server/realtime_voice.rs`).

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::session::{OutboundMediaFrame, SessionEvent};

use super::{lookup_session_for_media, ServerState};

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum InboundFrame {
    Start { start: StartPayload },
    Media { media: MediaPayload },
    Stop,
}

#[derive(Debug, Deserialize)]
struct StartPayload {
    #[serde(rename = "streamSid")]
    stream_sid: String,
    #[serde(rename = "customParameters", default)]
    custom_parameters: std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct MediaPayload {
    payload: String,
}

pub async fn media_ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(|socket| handle_media_socket(socket, state))
}

async fn handle_media_socket(mut socket: WebSocket, state: ServerState) {
    // Wait for the first `start` frame to learn which session owns this
    // connection; nothing before that point can be attributed anywhere.
    let (call_id, stream_sid) = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                if let Ok(InboundFrame::Start { start }) = serde_json::from_str::<InboundFrame>(&text) {
                    let sessions = state.sessions.lock().await;
                    let call_id = start
                        .custom_parameters
                        .get("callId")
                        .and_then(|raw| lookup_session_for_media(&sessions, raw));
                    drop(sessions);
                    match call_id {
                        Some(id) => break (id, start.stream_sid),
                        None => {
                            close_with_policy_violation(&mut socket).await;
                            return;
                        }
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => return,
            Some(Err(_)) => return,
            _ => {}
        }
    };

    let events_tx = {
        let sessions = state.sessions.lock().await;
        match sessions.get(&call_id) {
            Some(handle) => handle.events_tx.clone(),
            None => {
                close_with_policy_violation(&mut socket).await;
                return;
            }
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundMediaFrame>();
    let _ = events_tx.send(SessionEvent::MediaAttached(outbound_tx));
    let _ = events_tx.send(SessionEvent::StartFrame { stream_sid: stream_sid.clone() });

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<InboundFrame>(&text) {
                            Ok(InboundFrame::Media { media }) => {
                                let _ = events_tx.send(SessionEvent::MediaFrame(media.payload.into_bytes()));
                            }
                            Ok(InboundFrame::Stop) => {
                                let _ = events_tx.send(SessionEvent::StopFrame);
                                break;
                            }
                            _ => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = events_tx.send(SessionEvent::StopFrame);
                        break;
                    }
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(OutboundMediaFrame::Audio(payload)) => {
                        let frame = json!({
                            "event": "media",
                            "streamSid": stream_sid,
                            "media": { "payload": payload },
                        });
                        if socket.send(Message::Text(frame.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(OutboundMediaFrame::Clear) => {
                        let frame = json!({ "event": "clear", "streamSid": stream_sid });
                        if socket.send(Message::Text(frame.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
}

async fn close_with_policy_violation(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: "no session for callId".into(),
        })))
        .await;
}
