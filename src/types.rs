//! Shared data-model types for the call-session core (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a transcript entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    Human,
    Assistant,
}

/// A single entry in a call's transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: TranscriptRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "isFinal")]
    pub is_final: bool,
}

/// Call lifecycle status. The last five variants are terminal; once a
/// `CallState` enters one of them it never leaves (§3 invariants).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Initiating,
    Ringing,
    InProgress,
    Completed,
    Busy,
    Failed,
    NoAnswer,
    Canceled,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallStatus::Completed
                | CallStatus::Busy
                | CallStatus::Failed
                | CallStatus::NoAnswer
                | CallStatus::Canceled
        )
    }
}

/// Per-session state, mutated only by the session's own task (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallState {
    #[serde(rename = "callId")]
    pub call_id: uuid::Uuid,
    #[serde(rename = "externalCallSid")]
    pub external_call_sid: Option<String>,
    #[serde(rename = "streamSid")]
    pub stream_sid: Option<String>,
    pub goal: String,
    pub context: String,
    pub status: CallStatus,
    pub transcript: Vec<TranscriptEntry>,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "endedAt")]
    pub ended_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
}

impl CallState {
    pub fn new(call_id: uuid::Uuid, goal: String, context: String) -> Self {
        Self {
            call_id,
            external_call_sid: None,
            stream_sid: None,
            goal,
            context,
            status: CallStatus::Initiating,
            transcript: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            summary: None,
        }
    }

    /// Moves to a new status. Terminal statuses are absorbing (§8 testable property).
    pub fn set_status(&mut self, status: CallStatus) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        if status.is_terminal() && self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
    }

    pub fn push_transcript(&mut self, role: TranscriptRole, text: impl Into<String>, is_final: bool) {
        self.transcript.push(TranscriptEntry {
            role,
            text: text.into(),
            timestamp: Utc::now(),
            is_final,
        });
    }
}

/// Conversation-history role (C7), distinct from `TranscriptRole`: the history
/// feeds the LLM and uses `user`/`assistant` vocabulary rather than `human`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HistoryRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: HistoryRole,
    pub content: String,
}

/// Protocol markers consumed by the session, never surfaced to transcripts (§3, §6).
pub const CALL_COMPLETE_MARKER: &str = "[CALL_COMPLETE]";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_status_is_absorbing() {
        let mut state = CallState::new(uuid::Uuid::new_v4(), "g".into(), "c".into());
        state.set_status(CallStatus::Completed);
        assert_eq!(state.status, CallStatus::Completed);
        assert!(state.ended_at.is_some());
        state.set_status(CallStatus::Failed);
        assert_eq!(state.status, CallStatus::Completed, "terminal status must not change");
    }

    #[test]
    fn ended_at_set_iff_terminal() {
        let mut state = CallState::new(uuid::Uuid::new_v4(), "g".into(), "c".into());
        assert!(state.ended_at.is_none());
        state.set_status(CallStatus::Ringing);
        assert!(state.ended_at.is_none());
        state.set_status(CallStatus::NoAnswer);
        assert!(state.ended_at.is_some());
    }
}
