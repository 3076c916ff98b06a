//! Command-line entry point (§4.10).
//!
//! A thin wrapper: load config, build the telephony client, start the
//! server. No subcommand tree, no REPL.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use crate::config::AppConfig;
use crate::server::ServerState;
use crate::telephony::TelephonyClient;

#[derive(Parser)]
#[command(name = "callcore")]
#[command(about = "Outbound call-session core", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the bind address from the config file.
    #[arg(long)]
    bind_addr: Option<String>,

    /// Override the public base URL from the config file.
    #[arg(long)]
    public_url: Option<String>,
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(p) => p,
        None => crate::config::default_config_path()?,
    };
    let mut config = AppConfig::load(&config_path)?;

    if let Some(bind_addr) = cli.bind_addr {
        config.bind_addr = bind_addr;
    }
    if let Some(public_url) = cli.public_url {
        config.call.public_url = public_url;
    }

    let telephony = TelephonyClient::new(
        config.call.telephony.api_base.clone(),
        config.call.telephony.account_sid.clone(),
        config.call.telephony.auth_token.clone(),
        config.call.telephony.from_number.clone(),
        config.call.public_url.clone(),
    );

    let state = ServerState::new(Arc::new(config), Arc::new(telephony));
    crate::server::start(state).await
}
