//! Outbound call-session core.
//!
//! Bridges telephony media, streaming speech-to-text, an LLM conversation
//! manager, and streaming text-to-speech into a single soft-real-time call
//! session, plus the dispatcher server that originates and routes calls.
//!
//! # Example
//!
//! ```ignore
//! use callcore::config::{AppConfig, default_config_path};
//! use callcore::server;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load(&default_config_path()?)?;
//!     server::start(server::ServerState::new(config.into(), telephony.into())).await
//! }
//! ```

pub mod types;
pub mod error;
pub mod config;
pub mod audio;
pub mod decoder;
pub mod stt;
pub mod tts;
pub mod telephony;
pub mod echo;
pub mod conversation;
pub mod llm;
pub mod session;
pub mod server;

pub mod cli;

pub use config::AppConfig;
pub use error::CoreError;
pub use server::{ServerState, start as start_server};
pub use session::CallSession;
pub use types::{CallState, CallStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
