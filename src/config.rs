//! Configuration management
//!
//! Layered config the way a server binary needs it: a file-backed `CallConfig`
//! (spec §3 — the immutable per-server settings every session is built from)
//! plus environment overrides for secrets, and a small set of operational
//! fields (`AppConfig`) that aren't part of the per-call contract.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Immutable per-server settings handed to every call session (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    pub telephony: TelephonyConfig,
    pub stt: SttConfig,
    pub tts: TtsConfig,
    pub llm: LlmConfig,
    /// Public base URL the telephony provider uses to reach this server
    /// (voice markup, media WebSocket, status webhooks).
    pub public_url: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelephonyConfig {
    #[serde(default = "default_telephony_api_base")]
    pub api_base: String,
    pub account_sid: String,
    #[serde(skip_serializing)]
    pub auth_token: String,
    pub from_number: String,
    /// Secret used to validate inbound webhook HMAC signatures (§4.5).
    #[serde(skip_serializing)]
    pub webhook_signing_secret: Option<String>,
}

fn default_telephony_api_base() -> String {
    "https://api.twilio.com/2010-04-01".to_string()
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        Self {
            api_base: default_telephony_api_base(),
            account_sid: String::new(),
            auth_token: String::new(),
            from_number: String::new(),
            webhook_signing_secret: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SttConfig {
    #[serde(skip_serializing)]
    pub api_key: String,
    pub endpoint: String,
    #[serde(default = "default_stt_language")]
    pub language: String,
}

fn default_stt_language() -> String {
    "en-US".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TtsConfig {
    #[serde(skip_serializing)]
    pub api_key: String,
    pub endpoint: String,
    pub voice: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    pub endpoint: String,
}

fn default_llm_model() -> String {
    "anthropic/claude-3.5-sonnet".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_llm_model(),
            endpoint: String::new(),
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            telephony: TelephonyConfig::default(),
            stt: SttConfig::default(),
            tts: TtsConfig::default(),
            llm: LlmConfig::default(),
            public_url: String::new(),
            port: default_port(),
        }
    }
}

/// Server-operational config wrapping `CallConfig`: bind address, log level,
/// and interval overrides that are not part of the immutable per-call
/// contract §3 describes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(flatten)]
    pub call: CallConfig,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_reconcile_interval_ms")]
    pub status_reconcile_interval_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_reconcile_interval_ms() -> u64 {
    10_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            call: CallConfig::default(),
            bind_addr: default_bind_addr(),
            status_reconcile_interval_ms: default_reconcile_interval_ms(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file, applying environment overrides
    /// for credentials that should not be committed to disk.
    pub fn load(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config file")?
        } else {
            AppConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TELEPHONY_AUTH_TOKEN") {
            self.call.telephony.auth_token = v;
        }
        if let Ok(v) = std::env::var("TELEPHONY_WEBHOOK_SECRET") {
            self.call.telephony.webhook_signing_secret = Some(v);
        }
        if let Ok(v) = std::env::var("STT_API_KEY") {
            self.call.stt.api_key = v;
        }
        if let Ok(v) = std::env::var("TTS_API_KEY") {
            self.call.tts.api_key = v;
        }
        if let Ok(v) = std::env::var("LLM_API_KEY") {
            self.call.llm.api_key = v;
        }
        if let Ok(v) = std::env::var("PUBLIC_URL") {
            self.call.public_url = v;
        }
    }

    /// Save configuration to file (secrets are skipped via `#[serde(skip_serializing)]`).
    pub fn save(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("failed to create config directory")?;
        }
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, contents).context("failed to write config file")?;
        Ok(())
    }
}

/// Default config file path, following the teacher's `directories::ProjectDirs`
/// convention adapted to a single server rather than a per-user app.
pub fn default_config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "callcore", "callcore")
        .context("failed to resolve project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_port() {
        let config = AppConfig::default();
        assert_eq!(config.call.port, 8080);
        assert_eq!(config.status_reconcile_interval_ms, 10_000);
    }

    #[test]
    fn env_overrides_apply() {
        std::env::set_var("LLM_API_KEY", "test-key-123");
        let mut config = AppConfig::default();
        config.apply_env_overrides();
        assert_eq!(config.call.llm.api_key, "test-key-123");
        std::env::remove_var("LLM_API_KEY");
    }
}
