//! Black-box coverage for the `/control` WebSocket broadcast contract (§4.9,
//! §6): a connected client must hear back a `{"type":"error",...}` message
//! whenever it sends something the server can't act on, whether that's
//! unparseable JSON or a well-formed command that fails downstream.

#[path = "support/mod.rs"]
mod support;

use futures_util::{SinkExt, StreamExt};
use tempfile::NamedTempFile;
use tokio_tungstenite::tungstenite::Message;

async fn connect(addr: std::net::SocketAddr) -> tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
> {
    let url = format!("ws://{addr}/control");
    let (ws, _response) = tokio_tungstenite::connect_async(&url).await.expect("connect to /control");
    ws
}

#[tokio::test]
async fn malformed_control_message_broadcasts_error() {
    let tmp = NamedTempFile::new().expect("temp config file");
    let state = support::test_state(support::unreachable_config(&tmp));
    let addr = support::spawn_router(state).await;

    let mut socket = connect(addr).await;
    socket.send(Message::Text("not even json".into())).await.expect("send");

    let reply = tokio::time::timeout(std::time::Duration::from_secs(2), socket.next())
        .await
        .expect("reply within timeout")
        .expect("stream not closed")
        .expect("valid frame");

    let Message::Text(text) = reply else { panic!("expected a text frame, got {reply:?}") };
    let parsed: serde_json::Value = serde_json::from_str(&text).expect("broadcast is JSON");
    assert_eq!(parsed["type"], "error");
    assert!(parsed["message"].as_str().unwrap().contains("unrecognized control message"));
}

#[tokio::test]
async fn initiate_call_over_control_socket_broadcasts_error_on_preflight_failure() {
    let tmp = NamedTempFile::new().expect("temp config file");
    let state = support::test_state(support::unreachable_config(&tmp));
    let addr = support::spawn_router(state).await;

    let mut socket = connect(addr).await;
    let command = serde_json::json!({
        "type": "initiate_call",
        "phoneNumber": "+15551234567",
        "goal": "reschedule the appointment",
        "context": "",
    });
    socket.send(Message::Text(command.to_string().into())).await.expect("send");

    let reply = tokio::time::timeout(std::time::Duration::from_secs(2), socket.next())
        .await
        .expect("reply within timeout")
        .expect("stream not closed")
        .expect("valid frame");

    let Message::Text(text) = reply else { panic!("expected a text frame, got {reply:?}") };
    let parsed: serde_json::Value = serde_json::from_str(&text).expect("broadcast is JSON");
    assert_eq!(parsed["type"], "error");
    assert!(parsed["callId"].is_null());
}
