// ABOUTME: Retry and timing tunables for the restoration scheduler.
// ABOUTME: Defaults: 3 attempts, 1 s between attempts, 5 min reschedule, 60 s tick.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Attempts per group or solo item before it counts as failed.
    pub max_attempts: u32,
    /// Fixed sleep between attempts.
    pub retry_delay: Duration,
    /// How far past the moment of failure a failed item is rescheduled.
    pub reschedule_delay: Duration,
    /// Interval between periodic passes.
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            reschedule_delay: Duration::from_secs(5 * 60),
            tick_interval: Duration::from_secs(60),
        }
    }
}

impl SchedulerConfig {
    pub fn reschedule_delay_millis(&self) -> i64 {
        i64::try_from(self.reschedule_delay.as_millis()).unwrap_or(i64::MAX)
    }
}
