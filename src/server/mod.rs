//! Call server (C9, spec §4.9).
//!
//! Owns the call registry and routing, grounded on the teacher's
//! `ServerState`/`Router` split in `src/server/mod.rs` (protected/public
//! route merge, `CorsLayer`, `TraceLayer`, `axum::serve` bootstrap) minus
//! the JWT auth layer, which has no counterpart here.

pub mod http;
pub mod control_ws;
pub mod media_ws;
pub mod webhooks;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::session::{CallSession, CallSessionConfig, MediaSink, ServerMessage, SessionEvent};
use crate::telephony::TelephonyProvider;
use crate::types::CallState;

pub const MAX_BODY_BYTES: usize = 1024 * 1024;
pub const MAX_PHONE_LEN: usize = 20;
pub const MAX_GOAL_LEN: usize = 1000;
pub const MAX_CONTEXT_LEN: usize = 5000;

pub struct SessionHandle {
    pub events_tx: mpsc::UnboundedSender<SessionEvent>,
    pub state_mirror: Arc<RwLock<CallState>>,
    pub external_call_sid: Option<String>,
}

#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<AppConfig>,
    pub telephony: Arc<dyn TelephonyProvider>,
    pub sessions: Arc<Mutex<HashMap<Uuid, SessionHandle>>>,
    pub control_broadcast: broadcast::Sender<ServerMessage>,
    pub http_client: reqwest::Client,
}

impl ServerState {
    pub fn new(config: Arc<AppConfig>, telephony: Arc<dyn TelephonyProvider>) -> Self {
        let (control_broadcast, _) = broadcast::channel(256);
        Self {
            config,
            telephony,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            control_broadcast,
            http_client: reqwest::Client::new(),
        }
    }
}

/// Start the call server: binds the HTTP/WebSocket listener and spawns the
/// status-reconciliation loop.
pub async fn start(state: ServerState) -> anyhow::Result<()> {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let router = Router::new()
        .route("/health", get(http::health_handler))
        .route("/status", get(http::status_all_handler))
        .route("/status/:call_id", get(http::status_one_handler))
        .route("/call", post(http::originate_call_handler))
        .route("/voice", get(http::voice_markup_handler))
        .route("/status-callback", post(webhooks::status_callback_handler))
        .route("/recordings/:external_call_sid", get(http::recordings_handler))
        .route("/control", get(control_ws::control_ws_handler))
        .route("/media", get(media_ws::media_ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    tokio::spawn(status_reconciliation_loop(state.clone()));

    let addr: SocketAddr = format!("{}:{}", state.config.bind_addr, state.config.call.port).parse()?;
    info!(%addr, "call server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

/// Every `STATUS_RECONCILE_INTERVAL_MS` (~10s, §4.9), poll provider status
/// for non-terminal sessions and advance the state machine if the provider
/// moved to a terminal state without a webhook delivery.
async fn status_reconciliation_loop(state: ServerState) {
    let interval = Duration::from_millis(state.config.status_reconcile_interval_ms);
    loop {
        tokio::time::sleep(interval).await;

        let snapshot: Vec<(Uuid, Option<String>)> = {
            let sessions = state.sessions.lock().await;
            sessions
                .iter()
                .map(|(id, handle)| (*id, handle.external_call_sid.clone()))
                .collect()
        };

        for (call_id, external_call_sid) in snapshot {
            let Some(sid) = external_call_sid else { continue };
            let is_terminal = {
                let sessions = state.sessions.lock().await;
                if let Some(handle) = sessions.get(&call_id) {
                    handle.state_mirror.read().await.status.is_terminal()
                } else {
                    true
                }
            };
            if is_terminal {
                continue;
            }

            match state.telephony.fetch_call_status(&sid).await {
                Ok(raw_status) => {
                    let status = webhooks::map_provider_status(&raw_status);
                    if status.is_terminal() {
                        let sessions = state.sessions.lock().await;
                        if let Some(handle) = sessions.get(&call_id) {
                            let _ = handle.events_tx.send(SessionEvent::StatusCallback(status));
                        }
                    }
                }
                Err(e) => {
                    error!(%call_id, error = %e, "status reconciliation poll failed");
                }
            }
        }
    }
}

pub fn lookup_session_for_media(
    sessions: &HashMap<Uuid, SessionHandle>,
    call_id: &str,
) -> Option<Uuid> {
    Uuid::parse_str(call_id).ok().filter(|id| sessions.contains_key(id))
}

/// Spawn a new `CallSession` task and register it in the server's session
/// table. Returns the channel callers use to feed it `SessionEvent`s.
pub async fn spawn_session(
    state: &ServerState,
    call_state: CallState,
    session_config: CallSessionConfig,
    conversation: crate::conversation::ConversationManager,
) -> mpsc::UnboundedSender<SessionEvent> {
    let call_id = call_state.call_id;
    let state_mirror = Arc::new(RwLock::new(call_state.clone()));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Every path that ends a call (StopFrame, ControlHangup, a terminal
    // telephony status, a fatal TTS/decoder error) funnels through
    // `CallSession::emit_ended`, which broadcasts exactly one `CallEnded`
    // here — so this is the single place that satisfies the §3 lifecycle
    // invariant and removes the session from the registry.
    let broadcast_tx = state.control_broadcast.clone();
    let sessions_for_cleanup = state.sessions.clone();
    tokio::spawn(async move {
        while let Some(msg) = control_rx.recv().await {
            if let ServerMessage::CallEnded { call_id: ended_id, .. } = &msg {
                if let Ok(id) = Uuid::parse_str(ended_id) {
                    sessions_for_cleanup.lock().await.remove(&id);
                }
            }
            let _ = broadcast_tx.send(msg);
        }
    });

    let stt_config = crate::stt::SttStreamConfig {
        endpoint: state.config.call.stt.endpoint.clone(),
        api_key: state.config.call.stt.api_key.clone(),
        language: state.config.call.stt.language.clone(),
    };

    let session = CallSession::new(
        call_state,
        session_config,
        conversation,
        MediaSink { tx: None },
        control_tx,
        events_tx.clone(),
        state_mirror.clone(),
    );

    {
        let mut sessions = state.sessions.lock().await;
        sessions.insert(
            call_id,
            SessionHandle { events_tx: events_tx.clone(), state_mirror, external_call_sid: None },
        );
    }

    tokio::spawn(session.run(events_rx, stt_config));

    events_tx
}
