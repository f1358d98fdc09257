//! Time utilities for the connector
//!
//! Record timestamps are Unix milliseconds so they survive serialization to
//! the journal and the wire.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch.
///
/// # Examples
/// ```
/// use nc_core::time::current_time_millis;
///
/// let now = current_time_millis();
/// assert!(now > 0);
/// ```
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Age of a millisecond timestamp relative to `now`.
///
/// Returns Duration::ZERO if the timestamp is in the future.
pub fn age(since_millis: u64, now_millis: u64) -> Duration {
    Duration::from_millis(now_millis.saturating_sub(since_millis))
}

/// Whether a timestamp is at least `threshold` old at `now`
pub fn is_older_than(since_millis: u64, threshold: Duration, now_millis: u64) -> bool {
    age(since_millis, now_millis) >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_time_millis_is_positive() {
        assert!(current_time_millis() > 0);
    }

    #[test]
    fn test_age_future_time() {
        assert_eq!(age(2_000, 1_000), Duration::ZERO);
        assert_eq!(age(1_000, 3_500), Duration::from_millis(2_500));
    }

    #[test]
    fn test_is_older_than_is_inclusive() {
        assert!(is_older_than(1_000, Duration::from_secs(1), 2_000));
        assert!(!is_older_than(1_001, Duration::from_secs(1), 2_000));
        assert!(is_older_than(5_000, Duration::ZERO, 5_000));
    }
}
