//! Telephony provider adapter (C5, spec §4.5).
//!
//! `originate`/`hangup`/`fetchRecordings` are thin authenticated HTTP calls
//! against the provider's REST API; `voiceMarkup`/`errorMarkup` render the
//! provider's control-document XML; `validate_webhook_signature` is an
//! HMAC-SHA256 check grounded on the teacher's
//! `SlackClient::verify_signature` (`src/messaging/slack.rs`), adapted from
//! Slack's `v0:{timestamp}:{body}` basestring to the provider's
//! `sha256(url + sorted_params)` convention.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;

use crate::error::CoreError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct OriginateResult {
    pub external_call_sid: String,
    pub status: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Recording {
    pub sid: String,
    pub url: String,
    pub duration_seconds: u32,
}

/// Provider-facing surface, mirroring the teacher's `MessagingPlatform`
/// trait (`src/messaging/mod.rs`) so the server can depend on `Arc<dyn
/// TelephonyProvider>` and tests can substitute `MockTelephonyProvider`
/// instead of dialing a real provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait TelephonyProvider: Send + Sync {
    async fn originate(&self, to: &str, call_id: &str) -> Result<OriginateResult, CoreError>;
    async fn verify_account(&self) -> Result<(), CoreError>;
    async fn hangup(&self, external_call_sid: &str) -> Result<(), CoreError>;
    async fn fetch_call_status(&self, external_call_sid: &str) -> Result<String, CoreError>;
    async fn fetch_recordings(&self, external_call_sid: &str) -> Result<Vec<Recording>, CoreError>;
    async fn download_recording(&self, url: &str) -> Result<Vec<u8>, CoreError>;
}

pub struct TelephonyClient {
    http: reqwest::Client,
    api_base: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
    public_url: String,
}

impl TelephonyClient {
    pub fn new(
        api_base: String,
        account_sid: String,
        auth_token: String,
        from_number: String,
        public_url: String,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base,
            account_sid,
            auth_token,
            from_number,
            public_url,
        }
    }
}

#[async_trait::async_trait]
impl TelephonyProvider for TelephonyClient {
    /// Places an outbound call. The provider is configured to POST status
    /// callbacks for {initiated, ringing, answered, completed} and to fetch
    /// control markup from `<publicUrl>/voice?callId=...` (§4.5).
    async fn originate(&self, to: &str, call_id: &str) -> Result<OriginateResult, CoreError> {
        let status_callback = format!("{}/status-callback?callId={}", self.public_url, call_id);
        let voice_url = format!("{}/voice?callId={}", self.public_url, call_id);

        let url = format!(
            "{}/Accounts/{}/Calls.json",
            self.api_base, self.account_sid
        );
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[
                ("To", to),
                ("From", self.from_number.as_str()),
                ("Url", &voice_url),
                ("StatusCallback", &status_callback),
                (
                    "StatusCallbackEvent",
                    "initiated ringing answered completed",
                ),
            ])
            .send()
            .await
            .map_err(|e| CoreError::Telephony(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CoreError::Telephony(format!(
                "originate failed: HTTP {}",
                response.status()
            )));
        }

        response
            .json::<OriginateResult>()
            .await
            .map_err(|e| CoreError::Telephony(e.to_string()))
    }

    /// Preflight check (§4.9): confirms the account exists and the
    /// configured from-number is actually provisioned on it, so a
    /// misconfigured account fails origination with a clear error instead of
    /// a provider-side 4xx partway through placing the call.
    async fn verify_account(&self) -> Result<(), CoreError> {
        let account_url = format!("{}/Accounts/{}.json", self.api_base, self.account_sid);
        let response = self
            .http
            .get(&account_url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await
            .map_err(|e| CoreError::Telephony(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CoreError::Telephony(format!(
                "account verification failed: HTTP {}",
                response.status()
            )));
        }

        let numbers_url = format!(
            "{}/Accounts/{}/IncomingPhoneNumbers.json?PhoneNumber={}",
            self.api_base, self.account_sid, self.from_number
        );
        let response = self
            .http
            .get(&numbers_url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await
            .map_err(|e| CoreError::Telephony(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CoreError::Telephony(format!(
                "from-number lookup failed: HTTP {}",
                response.status()
            )));
        }

        #[derive(serde::Deserialize)]
        struct Envelope {
            incoming_phone_numbers: Vec<serde_json::Value>,
        }
        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| CoreError::Telephony(e.to_string()))?;
        if envelope.incoming_phone_numbers.is_empty() {
            return Err(CoreError::Telephony(format!(
                "from-number {} is not provisioned on this account",
                self.from_number
            )));
        }
        Ok(())
    }

    /// Force termination of an in-progress call.
    async fn hangup(&self, external_call_sid: &str) -> Result<(), CoreError> {
        let url = format!(
            "{}/Accounts/{}/Calls/{}.json",
            self.api_base, self.account_sid, external_call_sid
        );
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("Status", "completed")])
            .send()
            .await
            .map_err(|e| CoreError::Telephony(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CoreError::Telephony(format!(
                "hangup failed: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Poll the provider's current status for a call (§4.9 status
    /// reconciliation) — used when a webhook delivery never arrived and a
    /// non-terminal session needs to be reconciled against the provider's
    /// own record of what happened.
    async fn fetch_call_status(&self, external_call_sid: &str) -> Result<String, CoreError> {
        let url = format!(
            "{}/Accounts/{}/Calls/{}.json",
            self.api_base, self.account_sid, external_call_sid
        );
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await
            .map_err(|e| CoreError::Telephony(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CoreError::Telephony(format!(
                "fetch_call_status failed: HTTP {}",
                response.status()
            )));
        }

        #[derive(serde::Deserialize)]
        struct Envelope {
            status: String,
        }
        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| CoreError::Telephony(e.to_string()))?;
        Ok(envelope.status)
    }

    /// Enumerate recordings for a call.
    async fn fetch_recordings(&self, external_call_sid: &str) -> Result<Vec<Recording>, CoreError> {
        let url = format!(
            "{}/Accounts/{}/Calls/{}/Recordings.json",
            self.api_base, self.account_sid, external_call_sid
        );
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await
            .map_err(|e| CoreError::Telephony(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CoreError::Telephony(format!(
                "fetch_recordings failed: HTTP {}",
                response.status()
            )));
        }

        #[derive(serde::Deserialize)]
        struct Envelope {
            recordings: Vec<Recording>,
        }
        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| CoreError::Telephony(e.to_string()))?;
        Ok(envelope.recordings)
    }

    /// Downloads a recording's raw PCM16 8kHz mono bytes from the provider's
    /// authenticated media URL, for the `?download=true` WAV path (§6).
    async fn download_recording(&self, url: &str) -> Result<Vec<u8>, CoreError> {
        let response = self
            .http
            .get(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await
            .map_err(|e| CoreError::Telephony(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CoreError::Telephony(format!(
                "download_recording failed: HTTP {}",
                response.status()
            )));
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| CoreError::Telephony(e.to_string()))
    }
}

/// Control document instructing the telephony side to open a bidirectional
/// audio bridge to `<publicUrl>/media?callId=...` with the inbound track
/// selected. Omitting `track="inbound_track"` silently drops caller audio
/// (§4.5) — this is the single most important line in the document.
pub fn voice_markup(public_url: &str, call_id: &str) -> String {
    let media_url = format!(
        "{}/media?callId={}",
        public_url.replace("https://", "wss://").replace("http://", "ws://"),
        call_id
    );
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <Response>\n\
         \x20 <Connect>\n\
         \x20   <Stream url=\"{media_url}\" track=\"inbound_track\" />\n\
         \x20 </Connect>\n\
         </Response>"
    )
}

/// Control document that speaks a short apology via the provider's
/// built-in synthesizer and terminates the call (§4.5), used when the
/// session cannot proceed (preflight failure, unrecoverable error).
pub fn error_markup(msg: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <Response>\n\
         \x20 <Say>{}</Say>\n\
         \x20 <Hangup/>\n\
         </Response>",
        escape_xml(msg)
    )
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Verify the provider's HMAC-SHA256 webhook signature before trusting a
/// status payload. The basestring is `url` followed by each `params` entry
/// (sorted by key) appended as `key + value`, matching the provider's
/// canonical signing convention.
pub fn validate_webhook_signature(
    auth_token: &str,
    signature: &str,
    url: &str,
    params: &BTreeMap<String, String>,
) -> bool {
    let mut basestring = url.to_string();
    for (key, value) in params {
        basestring.push_str(key);
        basestring.push_str(value);
    }

    let mut mac = match HmacSha256::new_from_slice(auth_token.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(basestring.as_bytes());
    let expected = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    expected == signature
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn voice_markup_always_selects_inbound_track() {
        let markup = voice_markup("https://example.com", "call-1");
        assert!(markup.contains("track=\"inbound_track\""));
        assert!(markup.contains("wss://example.com/media?callId=call-1"));
    }

    #[test]
    fn error_markup_escapes_and_hangs_up() {
        let markup = error_markup("sorry <bad> & stuff");
        assert!(markup.contains("&lt;bad&gt;"));
        assert!(markup.contains("<Hangup/>"));
    }

    #[test]
    fn webhook_signature_round_trips() {
        let token = "shh-secret";
        let url = "https://example.com/status?callId=abc";
        let mut params = BTreeMap::new();
        params.insert("CallStatus".to_string(), "completed".to_string());

        let mut basestring = url.to_string();
        for (k, v) in &params {
            basestring.push_str(k);
            basestring.push_str(v);
        }
        let mut mac = HmacSha256::new_from_slice(token.as_bytes()).unwrap();
        mac.update(basestring.as_bytes());
        let sig = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        assert!(validate_webhook_signature(token, &sig, url, &params));
    }

    #[tokio::test]
    async fn mock_provider_stands_in_for_a_real_preflight_failure() {
        let mut mock = MockTelephonyProvider::new();
        mock.expect_verify_account()
            .returning(|| Err(CoreError::Telephony("from-number not provisioned".into())));

        let provider: Arc<dyn TelephonyProvider> = Arc::new(mock);
        let err = provider.verify_account().await.unwrap_err();
        assert!(err.to_string().contains("not provisioned"));
    }

    #[test]
    fn webhook_signature_rejects_tampered_params() {
        let token = "shh-secret";
        let url = "https://example.com/status?callId=abc";
        let mut params = BTreeMap::new();
        params.insert("CallStatus".to_string(), "completed".to_string());
        let sig = "bm90LXRoZS1yaWdodC1zaWc=";
        assert!(!validate_webhook_signature(token, sig, url, &params));
    }
}
