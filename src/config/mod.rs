// pgbackup/src/config/mod.rs
use anyhow::{Context, Result, bail};
use std::time::Duration;

use crate::utils::retry::RetryPolicy;

pub const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_FILE_PREFIX: &str = "backup";
const DEFAULT_RESPAWN_PROTECTION_HOURS: i64 = 6;
const DEFAULT_S3_REGION: &str = "us-east-1";
const MAX_RESPAWN_PROTECTION_HOURS: i64 = 100 * 365 * 24;
const MAX_RETENTION_DAYS: i64 = 100 * 365;

#[derive(Debug, Clone)]
pub struct S3Config {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    pub region: String,
    /// Custom S3-compatible endpoint; switches the client to path-style addressing.
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GcsConfig {
    pub bucket: String,
    pub project_id: String,
    pub service_account_json: String,
}

#[derive(Debug, Clone)]
pub enum StorageConfig {
    S3(S3Config),
    Gcs(GcsConfig),
}

impl StorageConfig {
    pub fn provider(&self) -> &'static str {
        match self {
            StorageConfig::S3(_) => "s3",
            StorageConfig::Gcs(_) => "gcs",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub database_url: String,
    /// Filename prefix; also the storage namespace every key lives under.
    pub file_prefix: String,
    pub pg_dump_options: String,
    pub respawn_protection: Duration,
    pub force_backup: bool,
    /// Zero disables cleanup.
    pub retention_days: u32,
    pub query_retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub backup: BackupConfig,
    pub storage: StorageConfig,
    pub log_level: String,
}

impl AppConfig {
    /// Reads the process environment, after merging a `.env` file if one exists.
    pub fn from_env() -> Result<Self> {
        // A missing .env file is the normal case in containers.
        let _ = dotenv::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds and validates the configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &str, purpose: &str| {
            var(key).with_context(|| format!("{key} is required{purpose}"))
        };

        let database_url = required("DATABASE_URL", "")?;
        let provider = required("STORAGE_PROVIDER", "")?;

        let storage = match provider.to_ascii_lowercase().as_str() {
            "s3" => {
                let endpoint = var("S3_ENDPOINT");
                let region = match (var("S3_REGION"), &endpoint) {
                    (Some(region), _) => region,
                    (None, Some(_)) => DEFAULT_S3_REGION.to_string(),
                    (None, None) => {
                        bail!("S3_REGION is required for S3 storage (unless S3_ENDPOINT is set)")
                    }
                };
                StorageConfig::S3(S3Config {
                    access_key_id: required("AWS_ACCESS_KEY_ID", " for S3 storage")?,
                    secret_access_key: required("AWS_SECRET_ACCESS_KEY", " for S3 storage")?,
                    bucket: required("S3_BUCKET", " for S3 storage")?,
                    region,
                    endpoint,
                })
            }
            "gcs" => StorageConfig::Gcs(GcsConfig {
                bucket: required("GCS_BUCKET", " for GCS storage")?,
                project_id: required("GOOGLE_PROJECT_ID", " for GCS storage")?,
                service_account_json: required("GOOGLE_SERVICE_ACCOUNT_JSON", " for GCS storage")?,
            }),
            other => bail!("invalid STORAGE_PROVIDER: {other} (must be 's3' or 'gcs')"),
        };

        let respawn_hours = parse_or(var("RESPAWN_PROTECTION_HOURS"), DEFAULT_RESPAWN_PROTECTION_HOURS);
        if respawn_hours < 0 {
            bail!("RESPAWN_PROTECTION_HOURS must be non-negative");
        }
        if respawn_hours > MAX_RESPAWN_PROTECTION_HOURS {
            bail!("RESPAWN_PROTECTION_HOURS must be at most {MAX_RESPAWN_PROTECTION_HOURS}");
        }
        let retention_days = parse_or(var("RETENTION_DAYS"), 0i64);
        if retention_days < 0 {
            bail!("RETENTION_DAYS must be non-negative");
        }
        if retention_days > MAX_RETENTION_DAYS {
            bail!("RETENTION_DAYS must be at most {MAX_RETENTION_DAYS}");
        }
        let retention_days =
            u32::try_from(retention_days).context("RETENTION_DAYS is out of range")?;

        let defaults = RetryPolicy::query_default();
        let query_retry = RetryPolicy::new(
            positive_or(var("PSQL_RETRY_MAX_ATTEMPTS"), defaults.max_attempts),
            Duration::from_secs(positive_or(
                var("PSQL_RETRY_INITIAL_DELAY"),
                defaults.initial_delay.as_secs(),
            )),
            Duration::from_secs(positive_or(
                var("PSQL_RETRY_MAX_DELAY"),
                defaults.max_delay.as_secs(),
            )),
            defaults.multiplier,
        );

        Ok(AppConfig {
            backup: BackupConfig {
                database_url,
                file_prefix: var("BACKUP_FILE_PREFIX").unwrap_or_else(|| DEFAULT_FILE_PREFIX.to_string()),
                pg_dump_options: var("PG_DUMP_OPTIONS").unwrap_or_default(),
                respawn_protection: Duration::from_secs(respawn_hours.unsigned_abs() * 3600),
                force_backup: var("FORCE_BACKUP").and_then(|v| parse_bool(&v)).unwrap_or(false),
                retention_days,
                query_retry,
            },
            storage,
            log_level: var("LOG_LEVEL").unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        })
    }
}

/// Unparseable values fall back to the default rather than failing startup.
fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn positive_or<T: std::str::FromStr + PartialOrd + Default>(value: Option<String>, default: T) -> T {
    value
        .and_then(|v| v.parse().ok())
        .filter(|v| *v > T::default())
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "f" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}
