//! Shared black-box test harness: a config backed by a real temp file plus a
//! minimal router wired from the same handlers `server::start` uses, bound
//! to an ephemeral port so tests can drive it with a real HTTP/WS client.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use callcore::config::AppConfig;
use callcore::server::{control_ws, http as call_http, ServerState};
use callcore::telephony::TelephonyClient;
use tempfile::NamedTempFile;

/// Config pointed at closed/unreachable local ports so every network-backed
/// preflight check fails fast instead of hanging on a real provider.
pub fn unreachable_config(tmp: &NamedTempFile) -> AppConfig {
    let toml = r#"
port = 0

[telephony]
api_base = "http://127.0.0.1:1"
account_sid = "ACtest"
auth_token = "shh"
from_number = "+15005550006"

[stt]
api_key = "stt-key"
endpoint = "ws://127.0.0.1:1"

[tts]
api_key = "tts-key"
endpoint = "http://127.0.0.1:1"
voice = "default"

[llm]
api_key = "llm-key"
endpoint = "http://127.0.0.1:1"

public_url = "http://127.0.0.1:1"
"#;
    std::fs::write(tmp.path(), toml).expect("write temp config");
    AppConfig::load(&tmp.path().to_path_buf()).expect("load temp config")
}

pub fn test_state(config: AppConfig) -> ServerState {
    let telephony = TelephonyClient::new(
        config.call.telephony.api_base.clone(),
        config.call.telephony.account_sid.clone(),
        config.call.telephony.auth_token.clone(),
        config.call.telephony.from_number.clone(),
        config.call.public_url.clone(),
    );
    ServerState::new(Arc::new(config), Arc::new(telephony))
}

/// Binds the `/call` and `/control` routes to an ephemeral localhost port
/// and spawns the serve loop in the background, returning its address.
pub async fn spawn_router(state: ServerState) -> SocketAddr {
    let router = Router::new()
        .route("/call", post(call_http::originate_call_handler))
        .route("/control", get(control_ws::control_ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    addr
}
