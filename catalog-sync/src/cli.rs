///
/// This module implements the full CLI interface for catalog-sync: command parsing,
/// config overrides, and the async entrypoint shared by `main` and the integration tests.
///
/// All engine logic (streaming, pacing, retries, checkpoints, reports) lives in the
/// [`catalog-sync-core`] crate. This module is strictly CLI glue.
///
/// ## How To Use
/// - For command-line users: use the installed `catalog-sync` binary with `--help`.
/// - For programmatic/integration use: call [`run`] with a constructed [`Cli`].
///
/// ## Exit codes
/// `main` exits with 0 when a run completes, even if individual items failed, and with 2
/// when the run could not start because of its configuration (see [`exit_code`]).
///
/// [`catalog-sync-core`]: ../../catalog-sync-core/
use crate::load_config::{load_config, CliConfig};
use crate::remote::HttpRemote;
use anyhow::{Context, Result};
use catalog_sync_core::error::SyncError;
use catalog_sync_core::synchronise::synchronise;
use clap::{Parser, Subcommand};
use std::fmt;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// CLI for catalog-sync: push bulk catalog changes to a rate-limited API.
#[derive(Parser)]
#[clap(
    name = "catalog-sync",
    version,
    about = "Apply large batches of record changes to a rate-limited remote API, with retries, checkpoints and reports"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a synchronisation using the given config file
    Sync {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Input file, overriding `input.path`
        #[clap(long)]
        input: Option<PathBuf>,
        /// Validate and report without calling the remote
        #[clap(long)]
        dry_run: bool,
        /// Number of concurrent workers, overriding `engine.workers`
        #[clap(long)]
        workers: Option<usize>,
    },
    /// Load and validate the config file and secrets, then print the resolved settings
    Check {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
}

/// Context attached to errors that prevent a run from starting.
#[derive(Debug, Clone, Copy)]
pub struct FatalConfig;

impl fmt::Display for FatalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("fatal configuration error")
    }
}

/// Process exit code for an error returned by [`run`].
pub fn exit_code(err: &anyhow::Error) -> u8 {
    let fatal = err.downcast_ref::<FatalConfig>().is_some()
        || err
            .downcast_ref::<SyncError>()
            .is_some_and(SyncError::is_fatal_config);
    if fatal {
        2
    } else {
        1
    }
}

/// Loads the config and builds the HTTP remote; every failure here is fatal.
fn prepare(config: PathBuf, overrides: impl FnOnce(&mut CliConfig)) -> Result<(CliConfig, HttpRemote)> {
    let mut cfg = load_config(config).context(FatalConfig)?;
    overrides(&mut cfg);
    let token = cfg.bearer_token().context(FatalConfig)?.map(str::to_string);
    let remote = HttpRemote::new(&cfg.remote, token, cfg.engine.per_call_timeout()).context(FatalConfig)?;
    Ok((cfg, remote))
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    run_until(cli, CancellationToken::new()).await
}

/// Like [`run`], stopping the sync cooperatively when `cancel` fires.
pub async fn run_until(cli: Cli, cancel: CancellationToken) -> Result<()> {
    // Emit a top-level 'trace_initialised' event at the very start
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Sync {
            config,
            input,
            dry_run,
            workers,
        } => {
            let (cfg, remote) = prepare(config, |cfg| {
                if let Some(path) = input {
                    cfg.input.path = path;
                }
                if dry_run {
                    cfg.engine.dry_run = true;
                }
                if let Some(n) = workers {
                    cfg.engine.workers = n;
                }
            })?;
            let sync_config = cfg.synchronise_config().context(FatalConfig)?;
            tracing::info!(command = "sync", input = %sync_config.input.path.display(), "Starting synchronisation process");

            match synchronise(&sync_config, &remote, cancel).await {
                Ok(report) => {
                    tracing::info!(
                        command = "sync",
                        run_id = %report.run_id,
                        succeeded = report.summary.stats.succeeded,
                        failed = report.summary.stats.failed,
                        skipped = report.summary.stats.skipped,
                        "Synchronisation complete"
                    );
                    println!("{}", report.summary.to_markdown());
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(command = "sync", error = %e, "Synchronisation failed");
                    Err(e.into())
                }
            }
        }
        Commands::Check { config } => {
            let (cfg, _remote) = prepare(config, |_| {})?;
            let sync_config = cfg.synchronise_config().context(FatalConfig)?;
            tracing::info!(command = "check", "Configuration is valid");
            println!("Configuration OK");
            println!("input: {}", sync_config.input.path.display());
            println!("key field: {}", sync_config.input.validator.key_field());
            println!("remote: {:?} {}", cfg.remote.method, cfg.remote.url_template);
            println!(
                "token: {}",
                if cfg.token.is_some() { "set" } else { "not set" }
            );
            println!(
                "engine:\n{}",
                serde_yaml::to_string(&cfg.engine).context("failed to render engine settings")?
            );
            Ok(())
        }
    }
}
