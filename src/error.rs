//! Typed error taxonomy for the call-session core (spec §7).
//!
//! Library-facing code returns `Result<T, CoreError>` so callers can match on
//! kind (quota-exceeded vs. generic TTS failure, STT timeout vs. transport
//! close, ...) rather than sniffing strings. Orchestration code at the session
//! and HTTP-handler level works in `anyhow::Result` and attaches call-site
//! context before logging and converting to a status code or close frame.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// §7.1 config/preflight failures: surfaced as origination failure, no
    /// session is created.
    #[error("preflight failed: {0}")]
    Preflight(String),

    /// §7.2 STT connect timeout.
    #[error("STT unavailable: {0}")]
    SttUnavailable(String),

    /// §7.2 media/STT transport closed mid-call.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// §7.2 TTS quota exhausted — non-recoverable, terminates the call.
    #[error("TTS quota exceeded")]
    TtsQuotaExceeded,

    /// §7.2 TTS failure other than quota.
    #[error("TTS failed: {0}")]
    TtsFailed(String),

    /// §4.8 speak(): TTS produced no audio within the grace window, even
    /// after one retry.
    #[error("TTS produced no audio output")]
    TtsEmptyOutput,

    /// §7.3 LLM round-trip failure.
    #[error("LLM failed: {0}")]
    LlmFailed(String),

    /// §5.5 malformed/unknown control or media protocol input.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// §4.5 telephony adapter failures (originate/hangup/webhook).
    #[error("telephony error: {0}")]
    Telephony(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    /// Whether this error class should terminate the call outright rather
    /// than attempt a one-shot fallback (§7 policy).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::TtsQuotaExceeded | CoreError::Preflight(_) | CoreError::Telephony(_)
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
