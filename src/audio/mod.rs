//! Audio codec (C1): µ-law↔PCM conversion, RMS, resampling, DTMF tone
//! synthesis (spec §4.1).

pub mod dtmf;
pub mod mulaw;
pub mod resample;
pub mod rms;

pub use dtmf::{dtmf_duration_ms, generate_dtmf_sequence};
pub use mulaw::{mulaw_to_pcm16, pcm16_to_mulaw, MULAW_SILENCE};
pub use resample::resample_linear;
pub use rms::rms;

/// Pre-greeting VAD threshold (§4.8): RMS above this for ≥2 consecutive
/// frames is treated as remote speech.
pub const VAD_THRESHOLD: f32 = 0.015;
