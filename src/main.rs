//! PostgreSQL backup tool
//!
//! Dumps one database, streams the compressed archive to object storage and
//! prunes expired backups. Configured entirely from the environment.

// pgbackup/src/main.rs
mod backup;
mod config;
mod errors;
mod storage;
mod utils;

use std::process::ExitCode;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::prelude::*;

use backup::RunOutcome;
use config::{AppConfig, DEFAULT_LOG_LEVEL};

/// Main entry point for a single backup run
#[tokio::main]
async fn main() -> ExitCode {
    let config = AppConfig::from_env();
    init_tracing(
        config
            .as_ref()
            .map(|c| c.log_level.as_str())
            .unwrap_or(DEFAULT_LOG_LEVEL),
    );

    match run_app(config).await {
        Ok(RunOutcome::Skipped { reason }) => {
            info!(%reason, "Backup skipped");
            ExitCode::SUCCESS
        }
        Ok(RunOutcome::Completed(run)) => {
            info!(
                key = %run.key,
                timestamp = %run.timestamp,
                bytes = run.bytes,
                database = %run.info.name,
                expired_deleted = run.cleanup.as_ref().map_or(0, |c| c.deleted.len()),
                "Backup completed successfully"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = format!("{e:#}"), "Backup failed");
            ExitCode::FAILURE
        }
    }
}

async fn run_app(config: Result<AppConfig>) -> Result<RunOutcome> {
    let config = config.context("Failed to load configuration")?;
    info!(
        provider = config.storage.provider(),
        prefix = %config.backup.file_prefix,
        retention_days = config.backup.retention_days,
        "Starting pgbackup"
    );

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    backup::run_backup_flow(&config, &cancel)
        .await
        .context("Backup process failed")
}

fn init_tracing(level: &str) {
    let level = level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(Targets::new().with_default(level))
        .init();
}

/// Cancels the run on SIGINT or SIGTERM.
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    warn!("Shutdown signal received, cancelling backup");
    cancel.cancel();
}
