//! HTTP handlers for the call server (C9, spec §4.9).

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::conversation::ConversationManager;
use crate::llm::LlmClient;
use crate::session::CallSessionConfig;
use crate::telephony;
use crate::types::CallState;

use super::{spawn_session, ServerState, MAX_CONTEXT_LEN, MAX_GOAL_LEN, MAX_PHONE_LEN};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

#[derive(Debug, Serialize)]
pub struct ServerStatusResponse {
    pub status: &'static str,
    #[serde(rename = "activeCalls")]
    pub active_calls: usize,
    #[serde(rename = "controlClients")]
    pub control_clients: usize,
    #[serde(rename = "publicUrl")]
    pub public_url: String,
}

/// `GET /status`: server-level summary, distinct from the per-call
/// `GET /status/<callId>` below.
pub async fn status_all_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let sessions = state.sessions.lock().await;
    Json(ServerStatusResponse {
        status: "ok",
        active_calls: sessions.len(),
        control_clients: state.control_broadcast.receiver_count(),
        public_url: state.config.call.public_url.clone(),
    })
}

pub async fn status_one_handler(
    State(state): State<ServerState>,
    Path(call_id): Path<Uuid>,
) -> Response {
    let sessions = state.sessions.lock().await;
    match sessions.get(&call_id) {
        Some(handle) => {
            let snapshot = handle.state_mirror.read().await;
            Json(snapshot.clone()).into_response()
        }
        None => (StatusCode::NOT_FOUND, "no such call").into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct OriginateRequest {
    #[serde(rename = "phoneNumber")]
    pub to: String,
    pub goal: String,
    #[serde(default)]
    pub context: String,
}

#[derive(Debug, Serialize)]
pub struct OriginateResponse {
    #[serde(rename = "callId")]
    pub call_id: String,
    pub status: &'static str,
}

/// `POST /call` (§4.9): runs every preflight in parallel before placing the
/// call. Field caps: phone ≤ 20, goal ≤ 1000, context ≤ 5000.
pub async fn originate_call_handler(
    State(state): State<ServerState>,
    Json(request): Json<OriginateRequest>,
) -> Response {
    if request.to.len() > MAX_PHONE_LEN {
        return (StatusCode::BAD_REQUEST, "phone number too long").into_response();
    }
    if request.goal.len() > MAX_GOAL_LEN {
        return (StatusCode::BAD_REQUEST, "goal too long").into_response();
    }
    if request.context.len() > MAX_CONTEXT_LEN {
        return (StatusCode::BAD_REQUEST, "context too long").into_response();
    }

    match originate_call(&state, &request.to, &request.goal, &request.context).await {
        Ok(call_id) => {
            Json(OriginateResponse { call_id: call_id.to_string(), status: "initiating" }).into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, e).into_response(),
    }
}

/// Shared origination path used by both `POST /call` and the `/control`
/// socket's `initiate_call` message (§4.9, §6). Broadcasts `CallStarted`
/// on success so every control client, not just the caller, observes it.
pub async fn originate_call(
    state: &ServerState,
    to: &str,
    goal: &str,
    context: &str,
) -> Result<Uuid, String> {
    run_preflights(state, goal, context).await?;

    let call_id = Uuid::new_v4();
    let mut call_state = CallState::new(call_id, goal.to_string(), context.to_string());

    let originate_result = state
        .telephony
        .originate(to, &call_id.to_string())
        .await
        .map_err(|e| e.to_string())?;
    call_state.external_call_sid = Some(originate_result.external_call_sid.clone());

    let _ = state.control_broadcast.send(crate::session::ServerMessage::CallStarted {
        call_id: call_id.to_string(),
        call_sid: originate_result.external_call_sid.clone(),
    });

    let llm = LlmClient::new(
        state.config.call.llm.endpoint.clone(),
        state.config.call.llm.api_key.clone(),
        state.config.call.llm.model.clone(),
    );
    let conversation = ConversationManager::new(llm, goal);

    let session_config = CallSessionConfig {
        tts_endpoint: state.config.call.tts.endpoint.clone(),
        tts_api_key: state.config.call.tts.api_key.clone(),
        tts_voice: state.config.call.tts.voice.clone(),
        llm_system_prompt: format!(
            "You are an AI calling on behalf of a customer. Goal: {goal}. Context: {context}"
        ),
    };

    // The media socket attaches its own outbound channel once the
    // telephony side opens its WebSocket to `/media`; the session starts
    // with no media sink and picks one up via `SessionEvent::MediaAttached`.
    spawn_session(state, call_state, session_config, conversation).await;

    {
        let mut sessions = state.sessions.lock().await;
        if let Some(handle) = sessions.get_mut(&call_id) {
            handle.external_call_sid = Some(originate_result.external_call_sid.clone());
        }
    }

    Ok(call_id)
}

/// Every check in §4.9's preflight set runs concurrently; any single
/// failure fails the whole originate before a call is placed.
async fn run_preflights(state: &ServerState, goal: &str, context: &str) -> Result<(), String> {
    let decoder_check = tokio::task::spawn_blocking(|| {
        which_transcoder(crate::decoder::DEFAULT_TRANSCODER_BIN)
    });

    let account_check = state.telephony.verify_account();

    let stt_check = crate::stt::check_reachable(&state.config.call.stt.endpoint, &state.config.call.stt.api_key);

    let tts = crate::tts::TtsClient::new(
        state.config.call.tts.endpoint.clone(),
        state.config.call.tts.api_key.clone(),
        state.config.call.tts.voice.clone(),
    );
    let budget_check = async {
        let remaining = tts.remaining_quota().await?;
        Ok::<_, crate::error::CoreError>(crate::tts::check_budget(goal, context, remaining))
    };

    let public_url_check = check_public_url_round_trip(&state.http_client, &state.config.call.public_url);

    let (decoder_ok, account_result, stt_result, budget_result, public_url_result) =
        tokio::join!(decoder_check, account_check, stt_check, budget_check, public_url_check);

    if !decoder_ok.unwrap_or(false) {
        return Err("transcoder binary unavailable".to_string());
    }
    account_result.map_err(|e| format!("telephony account preflight failed: {e}"))?;
    stt_result.map_err(|e| format!("STT endpoint unreachable: {e}"))?;
    match budget_result {
        Ok(crate::tts::BudgetCheck::Sufficient) => {}
        Ok(crate::tts::BudgetCheck::QuotaExceeded) => {
            return Err("TTS quota insufficient for this call".to_string());
        }
        Err(e) => return Err(format!("TTS quota preflight failed: {e}")),
    }
    public_url_result.map_err(|e| format!("publicUrl round-trip failed: {e}"))?;

    Ok(())
}

/// Confirms the server is actually reachable at its own configured
/// `publicUrl` — the telephony provider needs to reach `/voice` and
/// `/status-callback` over the public internet, so a `publicUrl` that's
/// unreachable or misconfigured (wrong host, not yet DNS-propagated, behind
/// a firewall) must fail origination rather than surface as a mysterious
/// webhook timeout later.
async fn check_public_url_round_trip(client: &reqwest::Client, public_url: &str) -> Result<(), String> {
    let health_url = format!("{public_url}/health");
    let voice_url = format!("{public_url}/voice?callId=preflight");
    let status_url = format!("{public_url}/status");

    for url in [&health_url, &voice_url, &status_url] {
        let response = client.get(url).send().await.map_err(|e| format!("{url}: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("{url}: HTTP {}", response.status()));
        }
    }
    Ok(())
}

fn which_transcoder(bin: &str) -> bool {
    std::process::Command::new(bin)
        .arg("-version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Telephony-voice path: serves control markup pointing the telephony side
/// at the media WebSocket.
pub async fn voice_markup_handler(
    State(state): State<ServerState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let call_id = match params.get("callId") {
        Some(id) => id.clone(),
        None => return (StatusCode::BAD_REQUEST, "missing callId").into_response(),
    };
    let markup = telephony::voice_markup(&state.config.call.public_url, &call_id);
    ([("content-type", "text/xml")], markup).into_response()
}

#[derive(Debug, Serialize)]
struct RecordingsResponse {
    recordings: Vec<telephony::Recording>,
}

/// `GET /recordings/<externalCallSid>[?download=true]` (§6). Without the
/// query flag, lists recordings; with it, streams the first one back as a
/// WAV file built from the provider's raw PCM16 8kHz mono bytes.
pub async fn recordings_handler(
    State(state): State<ServerState>,
    Path(external_call_sid): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let recordings = match state.telephony.fetch_recordings(&external_call_sid).await {
        Ok(r) => r,
        Err(e) => return (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    };

    let wants_download = params.get("download").map(|v| v == "true").unwrap_or(false);
    if !wants_download {
        return Json(RecordingsResponse { recordings }).into_response();
    }

    let Some(first) = recordings.first() else {
        return (StatusCode::NOT_FOUND, "no recordings available").into_response();
    };

    let raw = match state.telephony.download_recording(&first.url).await {
        Ok(bytes) => bytes,
        Err(e) => return (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    };

    let wav_bytes = match pcm16_to_wav_bytes(&raw) {
        Ok(b) => b,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e).into_response(),
    };

    (
        [
            ("content-type", "audio/wav".to_string()),
            (
                "content-disposition",
                format!("attachment; filename=\"{}.wav\"", first.sid),
            ),
        ],
        wav_bytes,
    )
        .into_response()
}

fn pcm16_to_wav_bytes(raw: &[u8]) -> Result<Vec<u8>, String> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| e.to_string())?;
        for chunk in raw.chunks_exact(2) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            writer.write_sample(sample).map_err(|e| e.to_string())?;
        }
        writer.finalize().map_err(|e| e.to_string())?;
    }
    Ok(cursor.into_inner())
}
