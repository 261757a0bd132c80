pub(crate) mod archive;
pub(crate) mod db_dump;
mod logic;
pub(crate) mod pg_version;
pub(crate) mod rate_limit;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info_span;

use crate::config::AppConfig;
use crate::storage::create_storage;
use crate::utils::redact_url;
use db_dump::PostgresDumper;
use logic::Orchestrator;
use rate_limit::RateLimiter;

pub use logic::RunOutcome;

/// Public entry point for one backup run: wires storage, dumper and limiter
/// from `config` and drives the orchestrator once.
pub async fn run_backup_flow(config: &AppConfig, cancel: &CancellationToken) -> Result<RunOutcome> {
    let storage_span = info_span!("storage", provider = config.storage.provider());
    let storage = create_storage(config, &storage_span)
        .await
        .context("Failed to initialise object storage")?;

    let backup = &config.backup;
    let dumper_span = info_span!(
        "postgres-backup",
        database = %redact_url(&backup.database_url)
    );
    let dumper = PostgresDumper::new(
        backup.database_url.clone(),
        &backup.pg_dump_options,
        backup.query_retry,
        cancel,
        dumper_span,
    )
    .await;

    let orchestrator = Orchestrator::new(
        storage,
        Arc::new(dumper),
        RateLimiter::new(backup.respawn_protection, backup.force_backup),
        backup.file_prefix.clone(),
        backup.retention_days,
        info_span!("orchestrator"),
    );
    orchestrator.run(cancel).await
}
