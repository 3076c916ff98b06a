//! Streaming MP3 decoder (C2, spec §4.2).
//!
//! Spawns an external transcoder subprocess that reads MP3 on stdin and
//! writes µ-law 8kHz mono on stdout. Grounded on the teacher's
//! `decode_webm_to_pcm` (`tokio::process::Command` piping pattern in
//! `src/server/realtime_voice.rs`), generalized from a batch
//! `wait_with_output` call into a true streaming pipe: `write()` queues bytes
//! onto the subprocess's stdin without blocking the caller, and stdout is
//! drained continuously into a channel of `DecoderEvent`s as chunks arrive.

use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::error::CoreError;

#[derive(Debug, Clone)]
pub enum DecoderEvent {
    Data(Vec<u8>),
    Close,
    Error(String),
}

/// Path to the external MP3→µ-law transcoder binary. Any streaming
/// transcoder may be substituted (§4.2); ffmpeg is the reference choice,
/// matching the teacher's own subprocess usage.
pub const DEFAULT_TRANSCODER_BIN: &str = "ffmpeg";

pub struct StreamingDecoder {
    stdin_tx: mpsc::UnboundedSender<StdinCommand>,
    kill_tx: mpsc::UnboundedSender<()>,
    events_rx: mpsc::UnboundedReceiver<DecoderEvent>,
}

enum StdinCommand {
    Write(Vec<u8>),
    End,
}

impl StreamingDecoder {
    /// Spawn a transcoder subprocess and begin draining its stdout.
    pub fn spawn(transcoder_bin: &str) -> Result<Self, CoreError> {
        let mut child = Command::new(transcoder_bin)
            .args([
                "-f", "mp3", "-i", "pipe:0",
                "-f", "mulaw", "-ar", "8000", "-ac", "1",
                "-loglevel", "error", "pipe:1",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CoreError::Preflight(format!("failed to spawn transcoder: {e}")))?;

        let mut stdin = child.stdin.take().expect("stdin was piped");
        let mut stdout = child.stdout.take().expect("stdout was piped");
        let mut stderr = child.stderr.take().expect("stderr was piped");

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<StdinCommand>();
        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<DecoderEvent>();

        // Writer task: non-blocking at the API surface (§4.2 contract) —
        // callers enqueue onto an unbounded channel and return immediately.
        tokio::spawn(async move {
            while let Some(cmd) = stdin_rx.recv().await {
                match cmd {
                    StdinCommand::Write(bytes) => {
                        if stdin.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    StdinCommand::End => {
                        let _ = stdin.shutdown().await;
                        break;
                    }
                }
            }
        });

        // Reader task: drains stdout into chunks, forwards stderr on failure.
        // Also owns `child`, since force-termination (`stop()`, §4.2) needs
        // to kill the process itself rather than just close its stdin —
        // a hung transcoder wouldn't notice EOF on its own in time for
        // barge-in to free the decoder generation immediately.
        let events_tx_reader = events_tx.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                tokio::select! {
                    result = stdout.read(&mut buf) => {
                        match result {
                            Ok(0) => break,
                            Ok(n) => {
                                let _ = events_tx_reader.send(DecoderEvent::Data(buf[..n].to_vec()));
                            }
                            Err(e) => {
                                let _ = events_tx_reader.send(DecoderEvent::Error(e.to_string()));
                                break;
                            }
                        }
                    }
                    _ = kill_rx.recv() => {
                        let _ = child.start_kill();
                        break;
                    }
                }
            }

            let exit = child.wait().await;
            if let Ok(status) = exit {
                if !status.success() {
                    let mut err_buf = String::new();
                    let _ = stderr.read_to_string(&mut err_buf).await;
                    let _ = events_tx_reader.send(DecoderEvent::Error(err_buf));
                    return;
                }
            }
            let _ = events_tx_reader.send(DecoderEvent::Close);
        });

        Ok(Self { stdin_tx, kill_tx, events_rx })
    }

    /// Queue MP3 bytes for the transcoder. Non-blocking at the API surface.
    pub fn write(&self, bytes: Vec<u8>) {
        let _ = self.stdin_tx.send(StdinCommand::Write(bytes));
    }

    /// Signal input EOF; the transcoder flushes remaining output then closes.
    pub fn end(&self) {
        let _ = self.stdin_tx.send(StdinCommand::End);
    }

    /// Force termination without waiting for graceful EOF flush: kills the
    /// transcoder subprocess directly rather than only closing stdin, so
    /// barge-in frees this generation immediately even if the process is
    /// hung and wouldn't otherwise notice stdin EOF.
    pub fn stop(&self) {
        let _ = self.kill_tx.send(());
    }

    /// Receive the next decoder event (data/close/error).
    pub async fn recv(&mut self) -> Option<DecoderEvent> {
        self.events_rx.recv().await
    }
}
