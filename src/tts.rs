//! TTS client (C4, spec §4.4).
//!
//! Issues a cancelable streaming synthesis HTTP request and emits raw audio
//! bytes. Grounded on the teacher's `OpenRouterClient::stream_complete`
//! (`src/agent/llm.rs`) for the chunked-HTTP-body streaming shape, adapted
//! from LLM token deltas to opaque TTS audio bytes; generation-tag discard
//! is modeled on the decoder/TTS event handlers in
//! `src/server/realtime_voice.rs`.

use futures_util::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::CoreError;

#[derive(Debug, Clone)]
pub enum TtsEvent {
    Audio { bytes: Vec<u8>, generation: u64 },
    Done { generation: u64 },
    Error { error: String, generation: u64 },
    Cancelled,
}

pub struct TtsClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    voice: String,
    /// Generation of the in-flight request, if any; bumping this value
    /// causes the streaming task to stop emitting and send `Cancelled`.
    current_generation: Arc<AtomicU64>,
}

impl TtsClient {
    pub fn new(endpoint: String, api_key: String, voice: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            api_key,
            voice,
            current_generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start a streaming synthesis for `text` tagged with `generation`.
    /// Returns a receiver of `TtsEvent`s; events from a generation older
    /// than the client's current one are never sent (the task checks before
    /// every emit, per §4.8's "decoder/TTS callbacks from an older
    /// generation are discarded").
    pub fn speak(&self, text: String, generation: u64) -> mpsc::UnboundedReceiver<TtsEvent> {
        self.current_generation.store(generation, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel();
        let http = self.http.clone();
        let endpoint = self.endpoint.clone();
        let api_key = self.api_key.clone();
        let voice = self.voice.clone();
        let current_generation = self.current_generation.clone();

        tokio::spawn(async move {
            let is_current = |gen: u64| current_generation.load(Ordering::SeqCst) == gen;

            let request = http
                .post(&endpoint)
                .bearer_auth(&api_key)
                .json(&serde_json::json!({ "text": text, "voice": voice, "stream": true }));

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    let _ = tx.send(TtsEvent::Error { error: e.to_string(), generation });
                    return;
                }
            };

            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS
                || response.status() == reqwest::StatusCode::PAYMENT_REQUIRED
            {
                let _ = tx.send(TtsEvent::Error {
                    error: "quota exceeded".to_string(),
                    generation,
                });
                return;
            }
            if !response.status().is_success() {
                let status = response.status();
                let _ = tx.send(TtsEvent::Error {
                    error: format!("TTS HTTP {status}"),
                    generation,
                });
                return;
            }

            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                if !is_current(generation) {
                    let _ = tx.send(TtsEvent::Cancelled);
                    return;
                }
                match chunk {
                    Ok(bytes) if !bytes.is_empty() => {
                        let _ = tx.send(TtsEvent::Audio { bytes: bytes.to_vec(), generation });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = tx.send(TtsEvent::Error { error: e.to_string(), generation });
                        return;
                    }
                }
            }

            if is_current(generation) {
                let _ = tx.send(TtsEvent::Done { generation });
            } else {
                let _ = tx.send(TtsEvent::Cancelled);
            }
        });

        rx
    }

    /// Abort the in-flight request by invalidating its generation; the
    /// streaming task observes this on its next chunk and stops emitting.
    pub fn cancel(&self) {
        self.current_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Preflight check (§4.9): queries the provider's remaining character
    /// quota so `check_budget` can compare it against this call's estimate
    /// before origination, rather than discovering exhaustion mid-call.
    pub async fn remaining_quota(&self) -> Result<u32, CoreError> {
        let quota_url = format!("{}/quota", self.endpoint.trim_end_matches('/'));
        let response = self
            .http
            .get(&quota_url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| CoreError::TtsFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CoreError::TtsFailed(format!(
                "quota query failed: HTTP {}",
                response.status()
            )));
        }

        #[derive(serde::Deserialize)]
        struct QuotaResponse {
            #[serde(rename = "remainingCharacters")]
            remaining_characters: u32,
        }
        let body: QuotaResponse = response
            .json()
            .await
            .map_err(|e| CoreError::TtsFailed(e.to_string()))?;
        Ok(body.remaining_characters)
    }
}

/// Estimate characters needed for a call (§4.4 budget preflight formula).
pub fn estimate_char_budget(goal: &str, context: &str) -> u32 {
    let estimate = 900.0 + 1.8 * goal.len() as f64 + 0.8 * context.len() as f64;
    estimate.clamp(1200.0, 3000.0) as u32
}

/// Result of a TTS budget preflight check (§4.4, §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetCheck {
    Sufficient,
    QuotaExceeded,
}

/// Compare the estimated character budget against the provider's remaining
/// quota, as reported by a preflight quota query.
pub fn check_budget(goal: &str, context: &str, remaining_chars: u32) -> BudgetCheck {
    let needed = estimate_char_budget(goal, context);
    if remaining_chars >= needed {
        BudgetCheck::Sufficient
    } else {
        BudgetCheck::QuotaExceeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_clamped_to_lower_bound() {
        assert_eq!(estimate_char_budget("", ""), 1200);
    }

    #[test]
    fn budget_is_clamped_to_upper_bound() {
        let huge = "x".repeat(5000);
        assert_eq!(estimate_char_budget(&huge, &huge), 3000);
    }

    #[test]
    fn budget_scales_with_goal_and_context_length() {
        let small = estimate_char_budget("short goal", "short context");
        let large = estimate_char_budget(&"goal ".repeat(50), &"context ".repeat(50));
        assert!(large >= small);
    }

    #[test]
    fn check_budget_reports_quota_exceeded_when_insufficient() {
        let result = check_budget(&"g".repeat(2000), &"c".repeat(2000), 100);
        assert_eq!(result, BudgetCheck::QuotaExceeded);
    }

    #[test]
    fn check_budget_reports_sufficient_when_ample() {
        let result = check_budget("hello", "world", 10_000);
        assert_eq!(result, BudgetCheck::Sufficient);
    }
}
