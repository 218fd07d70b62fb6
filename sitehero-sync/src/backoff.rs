//! Per-mutation retry schedule.

use crate::config::SyncConfig;
use std::time::Duration;

/// Delay schedule applied to a single mutation after consecutive transient
/// failures: 5s, 15s, 30s, 1min, then 5min for every later retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    steps: Vec<Duration>,
    cap: Duration,
}

impl BackoffSchedule {
    pub fn new(steps: Vec<Duration>, cap: Duration) -> Self {
        Self { steps, cap }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config
                .backoff_schedule_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            Duration::from_secs(config.backoff_cap_secs),
        )
    }

    /// Delay before the next attempt, given how many times the mutation has
    /// failed so far (1 after the first failure).
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        self.steps
            .get(failures as usize - 1)
            .copied()
            .unwrap_or(self.cap)
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_then_cap() {
        let b = BackoffSchedule::default();
        let secs: Vec<u64> = (1..=7).map(|n| b.delay_for(n).as_secs()).collect();
        assert_eq!(secs, vec![5, 15, 30, 60, 300, 300, 300]);
    }

    #[test]
    fn zero_failures_means_no_delay() {
        assert_eq!(BackoffSchedule::default().delay_for(0), Duration::ZERO);
    }
}
