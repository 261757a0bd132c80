// pgbackup/src/utils/filename.rs
use std::sync::LazyLock;

use chrono::{DateTime, Datelike, NaiveDateTime, TimeDelta, Timelike, Utc};
use regex::Regex;

use crate::errors::FilenameError;

/// Suffix of every backup object: a gzip-compressed tar archive.
pub const ARCHIVE_EXTENSION: &str = ".tar.gz";

const DEFAULT_PREFIX: &str = "backup";
const UNKNOWN_VERSION: &str = "unknown";
const SECONDS_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";
/// Width of `YYYY-MM-DDTHH-mm-ss-SSSZ`.
const TIMESTAMP_WIDTH: usize = 24;

static TIMESTAMP_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}-\d{2}-\d{2}-\d{3}Z$").expect("static regex")
});

/// Builds `<prefix>-pg<major>-<YYYY-MM-DDTHH-mm-ss>-<millis>Z.tar.gz` in UTC.
pub fn generate_backup_filename(
    prefix: &str,
    timestamp: DateTime<Utc>,
    server_version: &str,
) -> String {
    let prefix = prefix.trim_end_matches('-');
    let prefix = if prefix.is_empty() { DEFAULT_PREFIX } else { prefix };
    format!(
        "{}-pg{}-{}{}",
        prefix,
        major_version_tag(server_version),
        format_timestamp(timestamp),
        ARCHIVE_EXTENSION
    )
}

/// Recovers the millisecond-precision timestamp encoded at the end of a backup key.
///
/// Directory components and the prefix are ignored; only the fixed-width
/// segment before the extension is read.
pub fn parse_backup_filename(key: &str) -> Result<DateTime<Utc>, FilenameError> {
    let name = key.strip_suffix(ARCHIVE_EXTENSION).unwrap_or(key);
    if name.len() < TIMESTAMP_WIDTH {
        return Err(FilenameError::TooShort(key.to_string()));
    }
    let segment = name
        .get(name.len() - TIMESTAMP_WIDTH..)
        .ok_or_else(|| FilenameError::InvalidFormat(key.to_string()))?;
    if !TIMESTAMP_SHAPE.is_match(segment) {
        return Err(FilenameError::InvalidFormat(segment.to_string()));
    }

    // Shape is validated, so the slices below are ASCII digit runs.
    let (seconds_part, millis_part) = (&segment[..19], &segment[20..23]);
    let base = NaiveDateTime::parse_from_str(seconds_part, SECONDS_FORMAT).map_err(|source| {
        FilenameError::InvalidTimestamp {
            segment: segment.to_string(),
            source,
        }
    })?;
    let millis: i64 = millis_part
        .parse()
        .map_err(|_| FilenameError::InvalidFormat(segment.to_string()))?;

    Ok((base + TimeDelta::milliseconds(millis)).and_utc())
}

/// Storage key for a backup: `<YYYY>/<MM>/<filename>`.
pub fn storage_key(timestamp: DateTime<Utc>, filename: &str) -> String {
    format!("{}/{:02}/{}", timestamp.year(), timestamp.month(), filename)
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    let millis = timestamp.nanosecond() % 1_000_000_000 / 1_000_000;
    format!("{}-{:03}Z", timestamp.format(SECONDS_FORMAT), millis)
}

/// Major version from a server version string, e.g. `"PostgreSQL 16.2 on x86_64"` -> `"16"`.
fn major_version_tag(server_version: &str) -> String {
    server_version
        .split_whitespace()
        .filter_map(|token| token.split_once('.').map(|(major, _)| major))
        .find(|major| !major.is_empty() && major.bytes().all(|b| b.is_ascii_digit()))
        .map(str::to_string)
        .unwrap_or_else(|| UNKNOWN_VERSION.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32, ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap() + TimeDelta::milliseconds(ms)
    }

    #[test]
    fn test_generate_format() {
        let ts = at(2024, 1, 15, 14, 30, 45, 123);
        assert_eq!(
            generate_backup_filename("backup", ts, "PostgreSQL 16.2 on x86_64-pc-linux-gnu"),
            "backup-pg16-2024-01-15T14-30-45-123Z.tar.gz"
        );
        assert_eq!(
            generate_backup_filename("nightly-", ts, "15.4"),
            "nightly-pg15-2024-01-15T14-30-45-123Z.tar.gz"
        );
        assert_eq!(
            generate_backup_filename("", ts, "unknown"),
            "backup-pgunknown-2024-01-15T14-30-45-123Z.tar.gz"
        );
    }

    #[test]
    fn test_major_version_tag_fallbacks() {
        assert_eq!(major_version_tag("PostgreSQL 17.0 (Debian 17.0-1.pgdg120+1)"), "17");
        assert_eq!(major_version_tag(""), "unknown");
        assert_eq!(major_version_tag("unknown"), "unknown");
        assert_eq!(major_version_tag("PostgreSQL devel"), "unknown");
    }

    #[test]
    fn test_round_trip_recovers_timestamp() -> anyhow::Result<()> {
        let samples = [
            at(2024, 2, 29, 23, 59, 59, 999),
            at(1999, 12, 31, 0, 0, 0, 0),
            at(2025, 7, 4, 12, 5, 9, 7),
        ];
        for ts in samples {
            for version in ["PostgreSQL 14.11", "unknown"] {
                let name = generate_backup_filename("db-backups", ts, version);
                assert_eq!(parse_backup_filename(&name)?, ts, "{name}");
                assert_eq!(parse_backup_filename(&storage_key(ts, &name))?, ts);
            }
        }
        Ok(())
    }

    #[test]
    fn test_generate_truncates_below_milliseconds() -> anyhow::Result<()> {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
            + TimeDelta::nanoseconds(456_789_123);
        let parsed = parse_backup_filename(&generate_backup_filename("b", ts, "16.1"))?;
        assert_eq!(parsed, at(2024, 3, 1, 8, 0, 0, 456));
        Ok(())
    }

    #[test]
    fn test_parse_rejects_malformed_keys() {
        assert!(matches!(
            parse_backup_filename("short.tar.gz"),
            Err(FilenameError::TooShort(_))
        ));
        assert!(matches!(
            parse_backup_filename("backup-pg16-2024-01-15 14:30:45.123Z.tar.gz"),
            Err(FilenameError::InvalidFormat(_))
        ));
        assert!(matches!(
            parse_backup_filename("backup-pg16-2024-13-45T14-30-45-123Z.tar.gz"),
            Err(FilenameError::InvalidTimestamp { .. })
        ));
        assert!(parse_backup_filename("notes/readme-that-is-long-enough.txt").is_err());
    }

    #[test]
    fn test_storage_key_layout() {
        let ts = at(2024, 3, 9, 1, 2, 3, 4);
        assert_eq!(storage_key(ts, "x.tar.gz"), "2024/03/x.tar.gz");
    }
}
