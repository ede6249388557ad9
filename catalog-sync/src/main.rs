use catalog_sync::cli::{exit_code, run_until, Cli};
use clap::Parser;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize tracing for the CLI.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("CLI application startup: tracing initialised, environment loaded");

    let cli = Cli::parse();
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received; finishing in-flight calls before stopping");
                cancel.cancel();
            }
        });
    }

    tracing::info!("CLI arguments parsed, invoking run");
    match run_until(cli, cancel).await {
        Ok(()) => {
            tracing::info!("CLI completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "CLI exited with error");
            ExitCode::from(exit_code(&e))
        }
    }
}
