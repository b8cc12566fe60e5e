use std::time::Duration;

/// Next one-shot delay of an exponential backoff timer. No upper bound: saturates at `Duration::MAX`.
pub fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2)
}
