//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which path a row takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Direct call, retried in place.
    #[default]
    Fast,
    /// Parked as WAITING and submitted in a batch job by the clearing loop.
    Batch,
}

/// Configuration for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Failed attempts allowed per lineage before it is terminally failed
    pub attempts_cap: u32,

    /// Fast-path backoff unit; the wait after failure `n` is `cooldown_ms * n`
    pub cooldown_ms: u64,

    /// Maximum fast-path backoff in milliseconds
    pub max_backoff_ms: u64,

    /// Timeout for each individual fast-path call in milliseconds
    pub run_fast_timeout_ms: u64,

    /// Surface a synthetic response instead of an error when a row fails
    pub allow_failure: bool,

    /// Rows per batch job, and fast-path concurrency limit
    pub batch_size: usize,

    /// How long a batch job may run before its rows are returned to WAITING
    pub batch_timeout_hours: f64,

    /// Interval between polls of an open batch job (milliseconds)
    pub batch_poll_interval_ms: u64,

    /// Clearing loop budget, as a multiple of the batch timeout
    pub clearing_budget_factor: f64,

    /// How long the clearing loop sleeps when it has nothing to dispatch (milliseconds)
    pub clearing_idle_interval_ms: u64,

    /// A RUNNING row untouched for this long with no live owner is returned to WAITING
    pub stale_running_after_ms: u64,

    /// Interval for re-reading a row while awaiting its result (milliseconds)
    pub await_poll_interval_ms: u64,

    /// Give up awaiting a result after this long; `None` waits indefinitely
    pub await_timeout_ms: Option<u64>,

    /// Regions cycled through for successive attempts and batch submissions
    pub regions: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            attempts_cap: 3,
            cooldown_ms: 1000,
            max_backoff_ms: 60000,
            run_fast_timeout_ms: 120000,
            allow_failure: false,
            batch_size: 100,
            batch_timeout_hours: 24.0,
            batch_poll_interval_ms: 30000,
            clearing_budget_factor: 1.25,
            clearing_idle_interval_ms: 5000,
            stale_running_after_ms: 900000, // 15 minutes
            await_poll_interval_ms: 1000,
            await_timeout_ms: None,
            regions: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn run_fast_timeout(&self) -> Duration {
        Duration::from_millis(self.run_fast_timeout_ms)
    }

    pub fn batch_timeout(&self) -> Duration {
        hours(self.batch_timeout_hours)
    }

    pub fn stale_running_after(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.stale_running_after_ms as i64)
    }
}

/// Longest duration handed to timers and deadlines (about a century).
pub(crate) const FOREVER: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Convert fractional hours to a duration, treating negative or NaN input as zero.
///
/// Values too large to represent, including infinity, saturate at [`FOREVER`].
pub(crate) fn hours(hours: f64) -> Duration {
    if hours.is_nan() || hours <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(hours * 3600.0)
        .map_or(FOREVER, |duration| duration.min(FOREVER))
}

/// The instant `delay` from now, saturating instead of overflowing.
pub(crate) fn instant_after(delay: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(delay)
        .or_else(|| now.checked_add(FOREVER))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"attempts_cap": 5, "regions": ["us-east", "eu-west"]}"#)
                .unwrap();

        assert_eq!(config.attempts_cap, 5);
        assert_eq!(config.regions, vec!["us-east", "eu-west"]);
        assert_eq!(config.cooldown_ms, 1000);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.clearing_budget_factor, 1.25);
    }

    #[test]
    fn test_fractional_hours() {
        assert_eq!(hours(0.5), Duration::from_secs(1800));
        assert_eq!(hours(-1.0), Duration::ZERO);
        assert_eq!(hours(f64::NAN), Duration::ZERO);
        assert_eq!(hours(f64::INFINITY), FOREVER);
        assert_eq!(hours(1e10), FOREVER);
    }
}
