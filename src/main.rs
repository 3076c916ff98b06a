//! Outbound call-session core server entry point.

use callcore::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    if let Err(e) = cli::run().await {
        tracing::error!(error = ?e, "call server exited with error");
        std::process::exit(1);
    }
    Ok(())
}
