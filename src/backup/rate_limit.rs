// pgbackup/src/backup/rate_limit.rs
//! Respawn protection: refuses a new backup while the previous one is too recent.

use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub proceed: bool,
    pub reason: String,
}

impl RateLimitDecision {
    fn proceed(reason: impl Into<String>) -> Self {
        Self {
            proceed: true,
            reason: reason.into(),
        }
    }

    fn skip(reason: impl Into<String>) -> Self {
        Self {
            proceed: false,
            reason: reason.into(),
        }
    }
}

/// Time-based limiter. A pure policy object: it never sleeps.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    min_interval: Duration,
    force: bool,
}

impl RateLimiter {
    pub fn new(min_interval: Duration, force: bool) -> Self {
        Self {
            min_interval,
            force,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn should_backup(&self, last_backup: Option<DateTime<Utc>>) -> RateLimitDecision {
        self.should_backup_at(last_backup, Utc::now())
    }

    pub fn should_backup_at(
        &self,
        last_backup: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        if self.force {
            return RateLimitDecision::proceed("forced backup requested");
        }
        let Some(last_backup) = last_backup else {
            return RateLimitDecision::proceed("no previous backup found");
        };

        // A timestamp from the future counts as "just now".
        let elapsed = (now - last_backup).to_std().unwrap_or(Duration::ZERO);
        if elapsed < self.min_interval {
            let remaining = self.min_interval - elapsed;
            return RateLimitDecision::skip(format!(
                "last backup was {} ago, next backup allowed in {}",
                format_duration(elapsed),
                format_duration(remaining)
            ));
        }
        RateLimitDecision::proceed(format!("last backup was {} ago", format_duration(elapsed)))
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs < 60.0 {
        count_of(secs.round(), "second")
    } else if secs < 3600.0 {
        count_of((secs / 60.0).round(), "minute")
    } else {
        format!("{:.1} hours", secs / 3600.0)
    }
}

fn count_of(count: f64, unit: &str) -> String {
    if count == 1.0 {
        format!("1 {unit}")
    } else {
        format!("{count:.0} {unit}s")
    }
}
