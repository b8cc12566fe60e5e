use std::time::Duration;

/// Static configuration of a [`Timer`](crate::Timer).
///
/// Durations are kept in whole milliseconds: anything finer is truncated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerConfig {
    initial_delay: Duration,
    interval: Duration,
    threshold: u32,
    exponential_backoff: bool,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            interval: Duration::ZERO,
            threshold: 0,
            exponential_backoff: false,
        }
    }
}

impl TimerConfig {
    pub fn new() -> Self {
        Self::default()
    }
    /// Shortcut for the common `(initial, interval)` pair, in milliseconds.
    pub fn from_millis(initial_delay_ms: u64, interval_ms: u64) -> Self {
        Self::default()
            .initial_delay(Duration::from_millis(initial_delay_ms))
            .interval(Duration::from_millis(interval_ms))
    }
    /// Delay before the first expiration.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = truncate_to_millis(delay);
        self
    }
    /// Interval between subsequent expirations. Zero means one-shot.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = truncate_to_millis(interval);
        self
    }
    /// Maximum number of callback invocations. Zero means unbounded.
    pub fn threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }
    /// Rearm with a doubled one-shot delay after each expiration instead of a fixed interval.
    pub fn exponential_backoff(mut self, enabled: bool) -> Self {
        self.exponential_backoff = enabled;
        self
    }

    pub fn get_initial_delay(&self) -> Duration {
        self.initial_delay
    }
    pub fn get_interval(&self) -> Duration {
        self.interval
    }
    pub fn get_threshold(&self) -> u32 {
        self.threshold
    }
    pub fn is_exponential_backoff(&self) -> bool {
        self.exponential_backoff
    }
    pub fn is_periodic(&self) -> bool {
        !self.interval.is_zero()
    }
}

pub(crate) fn truncate_to_millis(duration: Duration) -> Duration {
    Duration::from_millis(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}
