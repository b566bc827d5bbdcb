//! Injectable scheduling strategies: region rotation and batch poll intervals.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Picks the region for the next attempt or batch submission.
pub trait RegionSelector: Send + Sync {
    /// `None` when no regions are configured.
    fn next_region(&self) -> Option<String>;
}

/// Cycles through a fixed list of regions, wrapping around.
#[derive(Debug, Default)]
pub struct RoundRobinRegions {
    regions: Vec<String>,
    cursor: AtomicUsize,
}

impl RoundRobinRegions {
    pub fn new(regions: Vec<String>) -> Self {
        Self {
            regions,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl RegionSelector for RoundRobinRegions {
    fn next_region(&self) -> Option<String> {
        if self.regions.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.regions.len();
        Some(self.regions[index].clone())
    }
}

/// Delay between successive polls of one batch job.
pub trait PollSchedule: Send + Sync {
    /// Delay after poll number `poll` (starting at 0).
    fn delay(&self, poll: u32) -> Duration;
}

/// The same delay between every poll.
#[derive(Debug, Clone, Copy)]
pub struct FixedInterval(pub Duration);

impl PollSchedule for FixedInterval {
    fn delay(&self, _poll: u32) -> Duration {
        self.0
    }
}

/// Starts at `initial` and grows by `step` per poll, up to `max`.
#[derive(Debug, Clone, Copy)]
pub struct SteppedInterval {
    pub initial: Duration,
    pub step: Duration,
    pub max: Duration,
}

impl PollSchedule for SteppedInterval {
    fn delay(&self, poll: u32) -> Duration {
        self.initial
            .saturating_add(self.step.saturating_mul(poll))
            .min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_wraps() {
        let regions =
            RoundRobinRegions::new(vec!["us".to_string(), "eu".to_string(), "ap".to_string()]);
        let picked: Vec<_> = (0..5).filter_map(|_| regions.next_region()).collect();
        assert_eq!(picked, vec!["us", "eu", "ap", "us", "eu"]);
    }

    #[test]
    fn test_no_regions() {
        assert_eq!(RoundRobinRegions::default().next_region(), None);
    }

    #[test]
    fn test_stepped_interval_caps() {
        let schedule = SteppedInterval {
            initial: Duration::from_secs(10),
            step: Duration::from_secs(10),
            max: Duration::from_secs(25),
        };
        assert_eq!(schedule.delay(0), Duration::from_secs(10));
        assert_eq!(schedule.delay(1), Duration::from_secs(20));
        assert_eq!(schedule.delay(2), Duration::from_secs(25));
        assert_eq!(FixedInterval(Duration::from_secs(3)).delay(9), Duration::from_secs(3));
    }
}
