//! Telephony status-callback webhook (C9, spec §4.9).
//!
//! Signature verification is mandatory whenever a signature header is
//! present; mismatch is rejected with 403 before the payload is trusted.

use std::collections::{BTreeMap, HashMap};

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use uuid::Uuid;

use crate::session::SessionEvent;
use crate::telephony::validate_webhook_signature;
use crate::types::CallStatus;

use super::ServerState;

#[derive(Debug, Deserialize)]
pub struct StatusCallbackForm {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "CallStatus")]
    pub call_status: String,
}

/// `callId` rides in the query string, not the form body (§6): the provider
/// echoes back whatever URL we gave it in `StatusCallback`, and we put
/// `?callId=...` on that URL at origination time.
pub async fn status_callback_handler(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    axum::extract::Form(form): axum::extract::Form<StatusCallbackForm>,
) -> Response {
    if let Some(signature) = headers.get("X-Webhook-Signature").and_then(|v| v.to_str().ok()) {
        let mut params = BTreeMap::new();
        params.insert("CallSid".to_string(), form.call_sid.clone());
        params.insert("CallStatus".to_string(), form.call_status.clone());

        let url = format!("{}/status-callback", state.config.call.public_url);
        let token = &state.config.call.telephony.auth_token;
        if !validate_webhook_signature(token, signature, &url, &params) {
            return (StatusCode::FORBIDDEN, "signature mismatch").into_response();
        }
    }

    let call_id = match query
        .get("callId")
        .and_then(|s| Uuid::parse_str(s).ok())
        .or_else(|| find_call_id_by_sid(&state, &form.call_sid))
    {
        Some(id) => id,
        None => return (StatusCode::NOT_FOUND, "unknown call").into_response(),
    };

    let status = map_provider_status(&form.call_status);

    let sessions = state.sessions.lock().await;
    if let Some(handle) = sessions.get(&call_id) {
        let _ = handle.events_tx.send(SessionEvent::StatusCallback(status));
    }

    StatusCode::OK.into_response()
}

fn find_call_id_by_sid(_state: &ServerState, _sid: &str) -> Option<Uuid> {
    // The server always passes `callId` in the StatusCallback URL at
    // origination time (see `TelephonyClient::originate`), so this is a
    // defensive fallback only; a full reverse index isn't maintained.
    None
}

pub(crate) fn map_provider_status(raw: &str) -> CallStatus {
    match raw {
        "queued" | "initiated" => CallStatus::Initiating,
        "ringing" => CallStatus::Ringing,
        "in-progress" | "answered" => CallStatus::InProgress,
        "completed" => CallStatus::Completed,
        "busy" => CallStatus::Busy,
        "failed" => CallStatus::Failed,
        "no-answer" => CallStatus::NoAnswer,
        "canceled" => CallStatus::Canceled,
        _ => CallStatus::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_provider_statuses() {
        assert_eq!(map_provider_status("ringing"), CallStatus::Ringing);
        assert_eq!(map_provider_status("completed"), CallStatus::Completed);
        assert_eq!(map_provider_status("no-answer"), CallStatus::NoAnswer);
    }

    #[test]
    fn unknown_status_maps_to_failed() {
        assert_eq!(map_provider_status("something-new"), CallStatus::Failed);
    }
}
