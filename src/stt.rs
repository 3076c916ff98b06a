//! STT client (C3, spec §4.3).
//!
//! Opens a streaming transcription WebSocket to the external provider.
//! Grounded on the teacher's Slack Socket Mode client
//! (`src/messaging/slack.rs::socket_mode::start_socket_mode` —
//! `connect_async` + a `while let Some(msg) = ws_stream.next().await` loop),
//! adapted from a JSON event/ack protocol to linear16 PCM frame feeding plus
//! transcript event emission.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::CoreError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Word {
    pub word: String,
    pub start: f64,
    pub end: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub enum SttEvent {
    Open,
    Transcript {
        text: String,
        is_final: bool,
        confidence: f64,
        words: Option<Vec<Word>>,
    },
    UnclearSpeech {
        text: String,
        confidence: f64,
    },
    Close,
    Error(String),
}

#[derive(Deserialize)]
struct RawWord {
    word: String,
    start: f64,
    end: f64,
    confidence: f64,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawSttMessage {
    Open,
    Transcript {
        text: String,
        #[serde(rename = "isFinal")]
        is_final: bool,
        confidence: f64,
        words: Option<Vec<RawWord>>,
    },
    UnclearSpeech {
        text: String,
        confidence: f64,
    },
}

/// Configured for `encoding = linear16`, `sampleRate = 8000`, `channels = 1`,
/// interim results enabled, endpointing ~300ms (§4.3).
pub struct SttStreamConfig {
    pub endpoint: String,
    pub api_key: String,
    pub language: String,
}

/// Cheap, cloneable handle for feeding PCM frames. `connect` hands back the
/// event stream separately, since consuming events needs `&mut` while
/// feeding audio doesn't — letting the session hold this handle directly
/// while a forwarding task owns the receiver.
#[derive(Clone)]
pub struct SttClient {
    audio_tx: mpsc::UnboundedSender<Vec<i16>>,
}

/// Preflight check (§4.9): opens and immediately closes a connection to
/// confirm the provider endpoint and credentials are reachable, without
/// paying for a full streaming session.
pub async fn check_reachable(endpoint: &str, api_key: &str) -> Result<(), CoreError> {
    let url = format!("{endpoint}?key={api_key}");
    let connect_fut = tokio_tungstenite::connect_async(&url);
    let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_fut)
        .await
        .map_err(|_| CoreError::SttUnavailable("connect timeout".into()))?
        .map_err(|e| CoreError::SttUnavailable(e.to_string()))?;
    let (mut sink, _stream) = ws_stream.split();
    let _ = sink.close().await;
    Ok(())
}

impl SttClient {
    /// Connect to the STT provider. Fails with `SttUnavailable` if the
    /// handshake doesn't complete within `CONNECT_TIMEOUT` (§4.3).
    ///
    /// Frames fed in before `Open` is observed are the caller's
    /// responsibility to hold back (§4.3) — the session gates `send_pcm`
    /// behind its own `stt_connected` flag and flushes its own queue on
    /// `SttEvent::Open`, so this client never needs to buffer anything
    /// itself; it only ever forwards what it's given.
    pub async fn connect(
        config: SttStreamConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SttEvent>), CoreError> {
        let url = format!(
            "{}?encoding=linear16&sampleRate=8000&channels=1&interim_results=true&endpointing=300&language={}&key={}",
            config.endpoint, config.language, config.api_key
        );

        let (audio_tx, audio_rx) = mpsc::unbounded_channel::<Vec<i16>>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<SttEvent>();

        let connect_fut = tokio_tungstenite::connect_async(&url);
        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_fut)
            .await
            .map_err(|_| CoreError::SttUnavailable("connect timeout".into()))?
            .map_err(|e| CoreError::SttUnavailable(e.to_string()))?;

        let (mut sink, mut stream) = ws_stream.split();
        let mut audio_rx = audio_rx;

        // Writer task: forwards every frame it's given directly. No pre-open
        // buffering here — the caller already withholds frames until it
        // observes `SttEvent::Open` (§4.3).
        tokio::spawn(async move {
            while let Some(pcm) = audio_rx.recv().await {
                let bytes: Vec<u8> = pcm.iter().flat_map(|s| s.to_le_bytes()).collect();
                if sink.send(WsMessage::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
        });

        let events_tx_reader = events_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        match serde_json::from_str::<RawSttMessage>(&text) {
                            Ok(RawSttMessage::Open) => {
                                let _ = events_tx_reader.send(SttEvent::Open);
                            }
                            Ok(RawSttMessage::Transcript { text, is_final, confidence, words }) => {
                                let words = words.map(|ws| {
                                    ws.into_iter()
                                        .map(|w| Word { word: w.word, start: w.start, end: w.end, confidence: w.confidence })
                                        .collect()
                                });
                                let _ = events_tx_reader.send(SttEvent::Transcript { text, is_final, confidence, words });
                            }
                            Ok(RawSttMessage::UnclearSpeech { text, confidence }) => {
                                let _ = events_tx_reader.send(SttEvent::UnclearSpeech { text, confidence });
                            }
                            Err(e) => {
                                let _ = events_tx_reader.send(SttEvent::Error(format!("malformed STT message: {e}")));
                            }
                        }
                    }
                    Ok(WsMessage::Close(_)) => {
                        let _ = events_tx_reader.send(SttEvent::Close);
                        break;
                    }
                    Err(e) => {
                        let _ = events_tx_reader.send(SttEvent::Error(e.to_string()));
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok((Self { audio_tx }, events_rx))
    }

    /// Feed a PCM16 frame straight to the writer task. Callers must hold
    /// frames back themselves until `SttEvent::Open` arrives.
    pub fn send_pcm(&self, pcm: Vec<i16>) {
        let _ = self.audio_tx.send(pcm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_struct_carries_seconds_since_stt_open() {
        let w = Word { word: "hi".into(), start: 0.12, end: 0.45, confidence: 0.9 };
        assert!(w.end > w.start);
    }
}
