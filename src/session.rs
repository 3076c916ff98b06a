//! Call session state machine (C8, spec §4.8).
//!
//! One `CallSession` owns one call end-to-end. All `CallState` mutation and
//! session-local flags (current generation, suppression deadline, timers)
//! happen on the single task that owns this struct — mirroring the
//! teacher's `VoiceCoordinator` (`src/voice/coordinator.rs`), which drives
//! its whole audio→STT→LLM→TTS pipeline from one owning task and talks to
//! the outside world only via `mpsc` channels. Wire framing (start/media/
//! stop events, outbound JSON+binary) follows `ClientMessage`/`ServerMessage`
//! /`OutboundMessage` in `src/server/realtime_voice.rs`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant as TokioInstant;
use tracing::{debug, error, warn};
use once_cell::sync::Lazy;

use crate::audio::{self, VAD_THRESHOLD};
use crate::conversation::{extract_dtmf_markers, ConversationManager, TurnContext};
use crate::decoder::{DecoderEvent, StreamingDecoder, DEFAULT_TRANSCODER_BIN};
use crate::echo::{self, EchoDecision};
use crate::error::CoreError;
use crate::stt::{SttClient, SttEvent, SttStreamConfig};
use crate::tts::{TtsClient, TtsEvent};
use crate::types::{CallState, CallStatus, TranscriptRole};
use std::sync::Arc;
use tokio::sync::RwLock;

const GREETING_DELAY_MS: i64 = 250;
const PRE_GREETING_IDLE_MS: i64 = 700;
const MAX_GREETING_DEFERRAL_MS: i64 = 2000;
const CALL_COMPLETION_DELAY_MS: i64 = 3000;
const POST_TTS_STT_SUPPRESSION_MS: i64 = 300;
const UNCLEAR_SPEECH_DEBOUNCE_MS: i64 = 1500;
const PENDING_AUDIO_QUEUE_CAP: usize = 500;
const RETRY_GRACE_MS: i64 = 250;
const RETRY_DELAY_MS: i64 = 200;

static SHORT_ACK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(yes|yeah|yep|yup|sure|ok|okay|no|nope|alright|right|correct|got it|sounds good)[.!]?\s*$")
        .unwrap()
});

/// Wire-format messages fanned out to every `/control` client (§6).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    CallStarted {
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(rename = "callSid")]
        call_sid: String,
    },
    CallRinging {
        #[serde(rename = "callId")]
        call_id: String,
    },
    CallConnected {
        #[serde(rename = "callId")]
        call_id: String,
    },
    Transcript {
        #[serde(rename = "callId")]
        call_id: String,
        text: String,
        role: TranscriptRole,
        #[serde(rename = "isFinal")]
        is_final: bool,
    },
    CallEnded {
        #[serde(rename = "callId")]
        call_id: String,
        summary: String,
        status: String,
        #[serde(rename = "callSid", skip_serializing_if = "Option::is_none")]
        call_sid: Option<String>,
    },
    Error {
        #[serde(rename = "callId", skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        message: String,
    },
}

/// A unified event the session's run loop reacts to, generalizing the
/// teacher's single-WebSocket message loop into a multi-source select over
/// media frames, STT events, TTS events, decoder events, and timers — all
/// funneled through one channel so the run loop has one place that ever
/// mutates session state.
pub enum SessionEvent {
    MediaFrame(Vec<u8>),
    StartFrame { stream_sid: String },
    StopFrame,
    Stt(SttEvent),
    Tts(TtsEvent),
    Decoder(DecoderEvent),
    StatusCallback(CallStatus),
    ControlHangup,
    /// An operator-initiated utterance from a `/control` client, bypassing
    /// the conversation manager's classifier pipeline entirely.
    ControlSpeak(String),
    /// The media WebSocket has attached and extracted this session's
    /// `callId` from its first `start` frame (§4.9 media-stream routing).
    /// Ownership of outbound media is handed to this sender from here on.
    MediaAttached(mpsc::UnboundedSender<OutboundMediaFrame>),
}

/// An outbound frame destined for the media WebSocket. The socket layer
/// wraps `Audio` payloads in the provider's media-frame envelope
/// (`{event:"media", streamSid, media:{payload}}`) and sends `Clear`
/// verbatim as the provider's clear-buffer control frame.
#[derive(Debug, Clone)]
pub enum OutboundMediaFrame {
    Audio(String),
    Clear,
}

/// Empty until the media socket attaches (§4.9); frames sent before attach
/// are dropped, matching the fact that nothing can be playing before a
/// socket exists.
pub struct MediaSink {
    pub tx: Option<mpsc::UnboundedSender<OutboundMediaFrame>>,
}

impl MediaSink {
    pub fn send_audio(&self, base64_payload: String) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(OutboundMediaFrame::Audio(base64_payload));
        }
    }

    pub fn send_clear(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(OutboundMediaFrame::Clear);
        }
    }
}

pub struct CallSessionConfig {
    pub tts_endpoint: String,
    pub tts_api_key: String,
    pub tts_voice: String,
    pub llm_system_prompt: String,
}

pub struct CallSession {
    pub state: CallState,
    conversation: ConversationManager,
    system_prompt: String,

    stt: Option<SttClient>,
    tts: TtsClient,
    decoder: Option<StreamingDecoder>,
    media_sink: MediaSink,
    control_tx: mpsc::UnboundedSender<ServerMessage>,
    /// Clone of the session's own event sender, used to spawn the STT
    /// event-forwarding task in `attach()`.
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    /// Read-only snapshot for cross-task access (§5: no shared mutable
    /// state, only channels or snapshots). Refreshed after every event.
    state_mirror: Arc<RwLock<CallState>>,

    pending_audio: VecDeque<Vec<i16>>,
    stt_connected: bool,

    decoder_generation: u64,
    is_speaking: bool,
    suppress_stt_until_ms: i64,

    started_at: Instant,
    greeted: bool,
    has_final_transcript: bool,
    vad_consecutive_frames: u32,
    remote_speech_detected_at_ms: Option<i64>,

    pending_transcript: String,
    is_processing_response: bool,
    last_final_transcript_at_ms: Option<i64>,

    /// Greeting deferral timer (§4.8, §9): a cancellable deadline raced
    /// against `events_rx` in `run()` rather than an inline blocking sleep,
    /// so VAD/transcript events keep being processed while it's pending.
    greeting_deadline: Option<TokioInstant>,
    pending_greeting: Option<String>,

    /// Turn-accumulation debounce timer (§4.8, §9). Reset to `now + window`
    /// every time a new final transcript chunk is folded into
    /// `pending_transcript`, so several chunks arriving within the window
    /// merge into one turn.
    debounce_deadline: Option<TokioInstant>,

    /// Unclear-speech reply timer (§4.8). Canceled if a real final
    /// transcript arrives before it fires.
    unclear_speech_deadline: Option<TokioInstant>,
    unclear_speech_epoch_at_start: u64,
    final_transcript_epoch: u64,

    /// Post-completion hangup delay (§4.8): lets the final assistant line
    /// finish playing out before the call is torn down.
    completion_deadline: Option<TokioInstant>,

    ended_emitted: bool,
}

impl CallSession {
    pub fn new(
        state: CallState,
        config: CallSessionConfig,
        conversation: ConversationManager,
        media_sink: MediaSink,
        control_tx: mpsc::UnboundedSender<ServerMessage>,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
        state_mirror: Arc<RwLock<CallState>>,
    ) -> Self {
        let tts = TtsClient::new(config.tts_endpoint, config.tts_api_key, config.tts_voice);
        Self {
            state,
            conversation,
            system_prompt: config.llm_system_prompt,
            stt: None,
            tts,
            decoder: None,
            media_sink,
            control_tx,
            events_tx,
            state_mirror,
            pending_audio: VecDeque::new(),
            stt_connected: false,
            decoder_generation: 0,
            is_speaking: false,
            suppress_stt_until_ms: 0,
            started_at: Instant::now(),
            greeted: false,
            has_final_transcript: false,
            vad_consecutive_frames: 0,
            remote_speech_detected_at_ms: None,
            pending_transcript: String::new(),
            is_processing_response: false,
            last_final_transcript_at_ms: None,
            greeting_deadline: None,
            pending_greeting: None,
            debounce_deadline: None,
            unclear_speech_deadline: None,
            unclear_speech_epoch_at_start: 0,
            final_transcript_epoch: 0,
            completion_deadline: None,
            ended_emitted: false,
        }
    }

    fn now_ms(&self) -> i64 {
        self.started_at.elapsed().as_millis() as i64
    }

    /// Step 1-5 of the media-socket attach sequence (§4.8). The caller is
    /// responsible for step 1 (wiring message/close/error handlers before
    /// any await) since that happens above this struct, at the transport
    /// layer; everything from STT connect onward happens here.
    pub async fn attach(&mut self, stt_config: SttStreamConfig) {
        // Step 2+3: create the STT client, connect in the background, and
        // forward its events into the session's own event loop so
        // `handle_stt_event` ever sees them.
        match SttClient::connect(stt_config).await {
            Ok((client, mut events_rx)) => {
                self.stt = Some(client);
                let forward_tx = self.events_tx.clone();
                tokio::spawn(async move {
                    while let Some(event) = events_rx.recv().await {
                        if forward_tx.send(SessionEvent::Stt(event)).is_err() {
                            break;
                        }
                    }
                });
            }
            Err(e) => {
                error!(call_id = %self.state.call_id, error = %e, "STT connect failed");
            }
        }
        // Step 4 (TTS client already constructed in `new`; its handlers are
        // the generation-tagged events consumed in the run loop).
    }

    /// Handle the initial `start` frame: begins the greeting timer and
    /// requires TTS to already be constructed (it is, from `new`).
    pub async fn handle_start(&mut self, stream_sid: String) {
        self.state.stream_sid = Some(stream_sid);
        self.state.set_status(CallStatus::InProgress);

        // Prefetch the greeting so synthesis can overlap the defer window.
        let greeting_text = self.conversation.greeting(&self.system_prompt).await.ok();

        self.pending_greeting = greeting_text;
        self.greeting_deadline = Some(TokioInstant::now() + Duration::from_millis(GREETING_DELAY_MS as u64));
    }

    /// Fires when `greeting_deadline` elapses in `run()`'s select loop
    /// (§4.8, §9). Re-arms the deadline instead of sleeping inline so
    /// `handle_media_frame`/`handle_stt_event` keep running concurrently —
    /// a `MediaFrame` arriving mid-defer can set
    /// `remote_speech_detected_at_ms` and this will see it next time it
    /// wakes, which an inline blocking sleep could never observe.
    async fn fire_greeting_timer(&mut self) {
        self.greeting_deadline = None;

        if self.has_final_transcript {
            self.pending_greeting = None;
            return;
        }

        let hard_deadline_ms = GREETING_DELAY_MS.max(MAX_GREETING_DEFERRAL_MS);
        let now = self.now_ms();
        let recent_speech = self
            .remote_speech_detected_at_ms
            .map(|t| now - t < PRE_GREETING_IDLE_MS)
            .unwrap_or(false);

        if recent_speech && now < hard_deadline_ms {
            let wait_until_ms = (now + PRE_GREETING_IDLE_MS).min(hard_deadline_ms);
            let remaining = (wait_until_ms - now).max(0) as u64;
            self.greeting_deadline = Some(TokioInstant::now() + Duration::from_millis(remaining));
            return;
        }

        if let Some(text) = self.pending_greeting.take() {
            self.greeted = true;
            if let Err(e) = self.speak(&text, true).await {
                error!(call_id = %self.state.call_id, error = %e, "greeting speech failed");
            }
        }
    }

    /// Inbound media frame: base64-decode, µ-law-decode, and forward to STT
    /// (or buffer). Pre-greeting VAD tracks consecutive above-threshold
    /// frames to support greeting deferral.
    pub fn handle_media_frame(&mut self, raw_mulaw_base64: &[u8]) {
        use base64::Engine;
        let mulaw_bytes = match base64::engine::general_purpose::STANDARD.decode(raw_mulaw_base64) {
            Ok(b) => b,
            Err(_) => return,
        };
        let pcm = audio::mulaw_to_pcm16(&mulaw_bytes);

        if !self.greeted {
            let level = audio::rms(&pcm);
            if level > VAD_THRESHOLD {
                self.vad_consecutive_frames += 1;
                if self.vad_consecutive_frames >= 2 && self.remote_speech_detected_at_ms.is_none() {
                    self.remote_speech_detected_at_ms = Some(self.now_ms());
                }
            } else {
                self.vad_consecutive_frames = 0;
            }
        }

        if self.stt_connected {
            if let Some(stt) = &self.stt {
                stt.send_pcm(pcm);
            }
        } else {
            if self.pending_audio.len() >= PENDING_AUDIO_QUEUE_CAP {
                self.pending_audio.pop_front();
            }
            self.pending_audio.push_back(pcm);
        }
    }

    /// Handle an `SttEvent`, including the turn-taking core (§4.8
    /// Transcript handling).
    pub async fn handle_stt_event(&mut self, event: SttEvent) {
        match event {
            SttEvent::Open => {
                self.stt_connected = true;
                if let Some(stt) = &self.stt {
                    while let Some(pcm) = self.pending_audio.pop_front() {
                        stt.send_pcm(pcm);
                    }
                }
            }
            SttEvent::Close => {
                self.stt_connected = false;
            }
            SttEvent::Error(e) => {
                warn!(call_id = %self.state.call_id, error = %e, "STT error");
            }
            SttEvent::UnclearSpeech { text, .. } => {
                self.handle_unclear_speech(text).await;
            }
            SttEvent::Transcript { text, is_final, words, .. } => {
                if text.trim().is_empty() {
                    return;
                }
                let transcript_end_ms = words
                    .as_ref()
                    .and_then(|ws| ws.iter().map(|w| w.end).fold(None, |acc: Option<f64>, e| {
                        Some(acc.map_or(e, |a| a.max(e)))
                    }))
                    .map(|max_end_secs| self.now_ms() + (max_end_secs * 1000.0) as i64);

                let decision = echo::decide(self.is_speaking, self.suppress_stt_until_ms, transcript_end_ms, self.now_ms());
                match decision {
                    EchoDecision::Overlap | EchoDecision::Speaking | EchoDecision::Suppressed => {
                        debug!(call_id = %self.state.call_id, ?decision, "dropping transcript event");
                        return;
                    }
                    EchoDecision::None => {}
                }

                let _ = self.control_tx.send(ServerMessage::Transcript {
                    call_id: self.state.call_id.to_string(),
                    text: text.clone(),
                    role: TranscriptRole::Human,
                    is_final,
                });

                if !is_final {
                    return;
                }

                self.has_final_transcript = true;
                self.final_transcript_epoch += 1;

                if self.pending_transcript.is_empty() {
                    self.pending_transcript = text;
                } else {
                    self.pending_transcript.push(' ');
                    self.pending_transcript.push_str(&text);
                }

                if self.is_processing_response {
                    return;
                }

                // Re-armed rather than slept on inline: a second chunk
                // arriving before this fires lands here again and pushes
                // the deadline out, which is how several final-transcript
                // chunks within the window merge into one turn.
                let window_ms = self.debounce_window_ms();
                self.debounce_deadline =
                    Some(TokioInstant::now() + Duration::from_millis(window_ms.max(0) as u64));
            }
        }
    }

    /// Fires when `debounce_deadline` elapses in `run()`'s select loop.
    async fn fire_debounce_timer(&mut self) {
        self.debounce_deadline = None;

        if self.is_processing_response || self.pending_transcript.is_empty() {
            return;
        }

        let human_text = std::mem::take(&mut self.pending_transcript);
        self.state.push_transcript(TranscriptRole::Human, human_text.clone(), true);
        self.last_final_transcript_at_ms = Some(self.now_ms());

        self.generate_ai_response(human_text).await;
    }

    fn debounce_window_ms(&self) -> i64 {
        let base = if is_likely_short_acknowledgement(&self.pending_transcript) {
            180
        } else if ends_with_terminal_punctuation(&self.pending_transcript) {
            220
        } else if self
            .last_final_transcript_at_ms
            .map(|t| self.now_ms() - t >= 5000)
            .unwrap_or(false)
        {
            800
        } else {
            500
        };

        let silence_since_end = self
            .last_final_transcript_at_ms
            .map(|t| (self.now_ms() - t).max(0))
            .unwrap_or(0);
        (base - silence_since_end).max(120)
    }

    async fn handle_unclear_speech(&mut self, _text: String) {
        if !self.greeted || self.is_speaking || self.is_processing_response {
            return;
        }
        if self.now_ms() < self.suppress_stt_until_ms {
            return;
        }
        self.unclear_speech_epoch_at_start = self.final_transcript_epoch;
        self.unclear_speech_deadline =
            Some(TokioInstant::now() + Duration::from_millis(UNCLEAR_SPEECH_DEBOUNCE_MS as u64));
    }

    /// Fires when `unclear_speech_deadline` elapses. Canceled if a real
    /// final transcript landed while it was pending.
    async fn fire_unclear_speech_timer(&mut self) {
        self.unclear_speech_deadline = None;

        if self.final_transcript_epoch != self.unclear_speech_epoch_at_start {
            return;
        }
        if self.is_speaking || self.is_processing_response {
            return;
        }
        let reply = self.conversation.respond_to_unclear_speech();
        if let Err(e) = self.speak(&reply, false).await {
            error!(call_id = %self.state.call_id, error = %e, "unclear-speech reply failed");
        }
    }

    /// `generateAIResponse` (§4.8 Response generation).
    async fn generate_ai_response(&mut self, human_text: String) {
        self.is_processing_response = true;

        let turn_context = TurnContext {
            short_acknowledgement: is_likely_short_acknowledgement(&human_text),
        };

        let mut assembled = String::new();
        let mut chunks: Vec<(String, Vec<String>)> = Vec::new();

        let result = {
            let mut collected_chunks = Vec::new();
            let system_prompt = self.system_prompt.clone();
            self.conversation
                .respond_streaming(&human_text, &turn_context, &system_prompt, |chunk| {
                    if let crate::conversation::ResponseChunk::Text(text) = chunk {
                        collected_chunks.push(text);
                    }
                })
                .await
                .map(|_| collected_chunks)
        };

        match result {
            Ok(collected_chunks) => {
                for raw_chunk in collected_chunks {
                    let (speakable, dtmf_sequences) = extract_dtmf_markers(&raw_chunk);
                    assembled.push_str(&raw_chunk);
                    chunks.push((speakable, dtmf_sequences));
                }

                let mut quota_exceeded = false;
                'chunks: for (speakable, dtmf_sequences) in chunks {
                    if !speakable.trim().is_empty() {
                        match self.speak(&speakable, true).await {
                            Ok(()) => {}
                            Err(CoreError::TtsQuotaExceeded) => {
                                quota_exceeded = true;
                                break 'chunks;
                            }
                            Err(e) => {
                                warn!(call_id = %self.state.call_id, error = %e, "chunk speech failed");
                            }
                        }
                    }
                    for digits in dtmf_sequences {
                        self.send_dtmf(&digits);
                    }
                }

                if quota_exceeded {
                    error!(call_id = %self.state.call_id, "TTS quota exceeded mid-response, ending call");
                    self.state.set_status(CallStatus::Failed);
                    self.cleanup().await;
                    self.is_processing_response = false;
                    return;
                }

                let cleaned = assembled
                    .replace(crate::types::CALL_COMPLETE_MARKER, "");
                let (cleaned, _) = extract_dtmf_markers(&cleaned);
                self.state.push_transcript(TranscriptRole::Assistant, cleaned.clone(), true);
                let _ = self.control_tx.send(ServerMessage::Transcript {
                    call_id: self.state.call_id.to_string(),
                    text: cleaned,
                    role: TranscriptRole::Assistant,
                    is_final: true,
                });

                if self.conversation.is_complete() {
                    self.is_processing_response = false;
                    self.completion_deadline =
                        Some(TokioInstant::now() + Duration::from_millis(CALL_COMPLETION_DELAY_MS as u64));
                    return;
                }
            }
            Err(CoreError::TtsQuotaExceeded) => {
                error!(call_id = %self.state.call_id, "TTS quota exceeded, ending call");
                self.state.set_status(CallStatus::Failed);
                self.cleanup().await;
            }
            Err(e) => {
                warn!(call_id = %self.state.call_id, error = %e, "LLM turn failed, falling back");
                if let Err(e) = self.speak("Sorry, could you repeat that?", true).await {
                    error!(call_id = %self.state.call_id, error = %e, "fallback speech failed");
                }
            }
        }

        self.is_processing_response = false;
    }

    /// `speak()` (§4.8). Synthesizes one chunk of text, with barge-in
    /// against any in-flight speech. Returns `Err(CoreError::TtsQuotaExceeded)`
    /// if the provider reports quota exhaustion, or
    /// `Err(CoreError::TtsEmptyOutput)` if synthesis produces no audio even
    /// after one retry (§4.8 step 7, §8).
    async fn speak(&mut self, text: &str, skip_transcript: bool) -> Result<(), CoreError> {
        if self.is_speaking {
            self.tts.cancel();
            if let Some(decoder) = self.decoder.take() {
                decoder.stop();
            }
            // Clear-buffer frame tells the media side to discard un-played audio.
            self.media_sink.send_clear();
        }

        let mut decoder_chunks_seen = self.speak_once(text).await?;

        if decoder_chunks_seen == 0 {
            tokio::time::sleep(Duration::from_millis(RETRY_GRACE_MS as u64)).await;
            warn!(call_id = %self.state.call_id, "TTS produced no audio output, retrying once");
            tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS as u64)).await;

            decoder_chunks_seen = self.speak_once(text).await?;

            if decoder_chunks_seen == 0 {
                self.is_speaking = false;
                error!(call_id = %self.state.call_id, "TTS produced no audio output after retry");
                return Err(CoreError::TtsEmptyOutput);
            }
        }

        if !skip_transcript {
            self.state.push_transcript(TranscriptRole::Assistant, text.to_string(), true);
            let _ = self.control_tx.send(ServerMessage::Transcript {
                call_id: self.state.call_id.to_string(),
                text: text.to_string(),
                role: TranscriptRole::Assistant,
                is_final: true,
            });
        }

        Ok(())
    }

    /// One synthesis attempt: spawns a fresh decoder generation, streams
    /// TTS audio through it, and returns how many decoder chunks were
    /// produced. Barge-in cancellation of a *prior* generation is handled
    /// by the caller before this is invoked; this only owns its own
    /// generation's lifecycle.
    async fn speak_once(&mut self, text: &str) -> Result<u32, CoreError> {
        self.decoder_generation += 1;
        let generation = self.decoder_generation;

        let decoder = match StreamingDecoder::spawn(DEFAULT_TRANSCODER_BIN) {
            Ok(d) => d,
            Err(e) => {
                error!(call_id = %self.state.call_id, error = %e, "failed to spawn decoder");
                return Err(e);
            }
        };
        self.decoder = Some(decoder);
        self.is_speaking = true;

        let mut tts_rx = self.tts.speak(text.to_string(), generation);
        let first_chunk_at = Instant::now();
        let mut first_chunk_recorded = false;
        let mut bytes_emitted: u64 = 0;
        let mut decoder_chunks_seen = 0u32;

        loop {
            tokio::select! {
                tts_event = tts_rx.recv() => {
                    match tts_event {
                        Some(TtsEvent::Audio { bytes, generation: g }) => {
                            if g != self.decoder_generation { continue; }
                            if let Some(decoder) = &self.decoder {
                                decoder.write(bytes);
                            }
                        }
                        Some(TtsEvent::Done { generation: g }) => {
                            if g != self.decoder_generation { continue; }
                            if let Some(decoder) = &self.decoder {
                                decoder.end();
                            }
                        }
                        Some(TtsEvent::Error { generation: g, error }) => {
                            if g != self.decoder_generation { continue; }
                            if error.contains("quota") {
                                if let Some(decoder) = self.decoder.take() {
                                    decoder.stop();
                                }
                                self.is_speaking = false;
                                return Err(CoreError::TtsQuotaExceeded);
                            }
                            warn!(call_id = %self.state.call_id, %error, "TTS error");
                            break;
                        }
                        Some(TtsEvent::Cancelled) | None => break,
                    }
                }
                decoder_event = async {
                    if let Some(decoder) = self.decoder.as_mut() { decoder.recv().await } else { None }
                } => {
                    match decoder_event {
                        Some(DecoderEvent::Data(bytes)) => {
                            if !first_chunk_recorded {
                                first_chunk_recorded = true;
                            }
                            bytes_emitted += bytes.len() as u64;
                            decoder_chunks_seen += 1;
                            use base64::Engine;
                            let payload = base64::engine::general_purpose::STANDARD.encode(&bytes);
                            self.media_sink.send_audio(payload);
                        }
                        Some(DecoderEvent::Close) => {
                            if generation == self.decoder_generation {
                                let streaming_elapsed_ms = first_chunk_at.elapsed().as_millis() as i64;
                                let audio_duration_ms = (bytes_emitted / 8) as i64;
                                let buffered_ms = (audio_duration_ms - streaming_elapsed_ms).max(0);
                                let candidate = self.now_ms() + buffered_ms + POST_TTS_STT_SUPPRESSION_MS;
                                self.suppress_stt_until_ms = echo::extend_suppression(self.suppress_stt_until_ms, candidate);
                                self.is_speaking = false;
                            }
                            break;
                        }
                        Some(DecoderEvent::Error(e)) => {
                            warn!(call_id = %self.state.call_id, error = %e, "decoder error");
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        self.is_speaking = false;
        Ok(decoder_chunks_seen)
    }

    /// `sendDtmf` (§4.8 DTMF): bypasses TTS and the decoder entirely.
    fn send_dtmf(&mut self, digits: &str) {
        let samples = audio::generate_dtmf_sequence(digits);
        use base64::Engine;
        let payload = base64::engine::general_purpose::STANDARD.encode(&samples);
        self.media_sink.send_audio(payload);

        let n = digits.chars().filter(|c| c.is_ascii_digit() || *c == '*' || *c == '#').count() as i64;
        let duration = audio::dtmf_duration_ms(n as u32) as i64;
        let candidate = self.now_ms() + duration + POST_TTS_STT_SUPPRESSION_MS;
        self.suppress_stt_until_ms = echo::extend_suppression(self.suppress_stt_until_ms, candidate);
    }

    /// Drives the session for its entire lifetime from a single task,
    /// consuming the unified event channel. This is the one place
    /// `CallState` and session-local flags are mutated (§5 concurrency
    /// model) — every other task talks to the session only by sending a
    /// `SessionEvent` here.
    pub async fn run(mut self, mut events_rx: mpsc::UnboundedReceiver<SessionEvent>, stt_config: SttStreamConfig) {
        let mut stt_config = Some(stt_config);

        loop {
            if self.state.status.is_terminal() && self.ended_emitted {
                break;
            }

            // Every timer is a cancellable deadline raced here against the
            // event channel (§9: "timers are cancellable tokens... not
            // Promise+timer state machines") rather than an inline blocking
            // sleep inside a handler, so a pending debounce/greeting/unclear-
            // speech/completion wait never stalls `events_rx` — a later event
            // can re-arm or cancel the deadline before it fires.
            tokio::select! {
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        SessionEvent::MediaAttached(tx) => {
                            self.media_sink.tx = Some(tx);
                            if let Some(config) = stt_config.take() {
                                self.attach(config).await;
                            }
                        }
                        SessionEvent::StartFrame { stream_sid } => self.handle_start(stream_sid).await,
                        SessionEvent::MediaFrame(bytes) => self.handle_media_frame(&bytes),
                        SessionEvent::StopFrame => {
                            self.state.set_status(CallStatus::Completed);
                            self.cleanup().await;
                        }
                        SessionEvent::Stt(stt_event) => self.handle_stt_event(stt_event).await,
                        SessionEvent::Tts(_) | SessionEvent::Decoder(_) => {
                            // Generation-tagged TTS/decoder events are consumed
                            // internally inside `speak()`'s own select loop; any
                            // event reaching here arrived after that loop already
                            // exited and is discarded as stale.
                        }
                        SessionEvent::StatusCallback(status) => {
                            self.state.set_status(status);
                            match status {
                                CallStatus::Ringing => {
                                    let _ = self.control_tx.send(ServerMessage::CallRinging {
                                        call_id: self.state.call_id.to_string(),
                                    });
                                }
                                CallStatus::InProgress => {
                                    let _ = self.control_tx.send(ServerMessage::CallConnected {
                                        call_id: self.state.call_id.to_string(),
                                    });
                                }
                                _ => {}
                            }
                            if self.state.status.is_terminal() {
                                self.cleanup().await;
                            }
                        }
                        SessionEvent::ControlHangup => {
                            self.state.set_status(CallStatus::Canceled);
                            self.cleanup().await;
                        }
                        SessionEvent::ControlSpeak(text) => {
                            if let Err(e) = self.speak(&text, false).await {
                                error!(call_id = %self.state.call_id, error = %e, "control-initiated speech failed");
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(self.greeting_deadline.unwrap_or_else(TokioInstant::now)),
                    if self.greeting_deadline.is_some() =>
                {
                    self.fire_greeting_timer().await;
                }
                _ = tokio::time::sleep_until(self.debounce_deadline.unwrap_or_else(TokioInstant::now)),
                    if self.debounce_deadline.is_some() =>
                {
                    self.fire_debounce_timer().await;
                }
                _ = tokio::time::sleep_until(self.unclear_speech_deadline.unwrap_or_else(TokioInstant::now)),
                    if self.unclear_speech_deadline.is_some() =>
                {
                    self.fire_unclear_speech_timer().await;
                }
                _ = tokio::time::sleep_until(self.completion_deadline.unwrap_or_else(TokioInstant::now)),
                    if self.completion_deadline.is_some() =>
                {
                    self.fire_completion_timer().await;
                }
            }
            *self.state_mirror.write().await = self.state.clone();
        }
    }

    /// Fires when `completion_deadline` elapses: the delayed hangup after
    /// the conversation manager reports the call complete.
    async fn fire_completion_timer(&mut self) {
        self.completion_deadline = None;
        self.state.set_status(CallStatus::Completed);
        self.cleanup().await;
    }

    /// Idempotent cleanup (§4.8 Cleanup). Safe to call multiple times.
    pub async fn cleanup(&mut self) {
        if let Some(decoder) = self.decoder.take() {
            decoder.stop();
        }
        self.pending_audio.clear();
        if self.state.ended_at.is_none() {
            self.state.set_status(CallStatus::Canceled);
        }
        self.emit_ended().await;
    }

    async fn emit_ended(&mut self) {
        if self.ended_emitted {
            return;
        }
        self.ended_emitted = true;

        let summary = self
            .state
            .transcript
            .iter()
            .map(|e| format!("{:?}: {}", e.role, e.text))
            .collect::<Vec<_>>()
            .join("\n");

        let status = serde_json::to_value(self.state.status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        let _ = self.control_tx.send(ServerMessage::CallEnded {
            call_id: self.state.call_id.to_string(),
            summary: summary.clone(),
            status,
            call_sid: self.state.external_call_sid.clone(),
        });
        self.state.summary = Some(summary);
    }
}

/// `isLikelyShortAcknowledgement` (§4.8 turn context).
fn is_likely_short_acknowledgement(text: &str) -> bool {
    SHORT_ACK_RE.is_match(text.trim())
}

fn ends_with_terminal_punctuation(text: &str) -> bool {
    matches!(text.trim().chars().last(), Some('.') | Some('!') | Some('?'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_acknowledgement_matches_common_phrases() {
        assert!(is_likely_short_acknowledgement("yes"));
        assert!(is_likely_short_acknowledgement("Sure."));
        assert!(is_likely_short_acknowledgement("sounds good"));
        assert!(!is_likely_short_acknowledgement("yes I would like to schedule an appointment"));
    }

    #[test]
    fn terminal_punctuation_detection() {
        assert!(ends_with_terminal_punctuation("Is that right?"));
        assert!(!ends_with_terminal_punctuation("Is that right"));
    }
}
