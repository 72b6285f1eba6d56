//! Exponential backoff with jitter for retryable failures.

use rand::Rng;
use std::time::Duration;

/// Exponent cap so the delay stops growing after this many failures.
const MAX_EXPONENT: u32 = 6;

/// Exponential backoff: `base * 2^failures`, capped at `cap`.
///
/// Monotonically non-decreasing in `consecutive_failures`.
pub fn backoff_seconds(base_secs: u64, consecutive_failures: u32, cap_secs: u64) -> u64 {
    let exponent = consecutive_failures.min(MAX_EXPONENT);
    (base_secs.saturating_mul(2u64.saturating_pow(exponent))).min(cap_secs)
}

/// Add up to 10% random jitter so a fleet of retries does not synchronize.
pub fn with_jitter(secs: u64) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=secs / 10 + 1);
    Duration::from_secs(secs + jitter)
}

/// Backoff for sync cycle failures (minutes-scale, capped at an hour).
pub fn sync_backoff_seconds(consecutive_failures: u32) -> u64 {
    backoff_seconds(60, consecutive_failures, 3600)
}

/// Backoff for webhook processing retries (seconds-scale).
pub fn webhook_backoff_seconds(attempts: u32) -> u64 {
    backoff_seconds(5, attempts, 300)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(sync_backoff_seconds(0), 60);
        assert_eq!(sync_backoff_seconds(1), 120);
        assert_eq!(sync_backoff_seconds(2), 240);
        assert_eq!(sync_backoff_seconds(10), sync_backoff_seconds(9));
        assert_eq!(sync_backoff_seconds(20), 3600);
    }

    #[test]
    fn backoff_is_monotonic() {
        let mut prev = 0;
        for failures in 0..20 {
            let delay = sync_backoff_seconds(failures);
            assert!(delay >= prev, "delay decreased at {failures} failures");
            prev = delay;
        }
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        for _ in 0..50 {
            let d = with_jitter(100);
            assert!(d.as_secs() >= 100);
            assert!(d.as_secs() <= 111);
        }
    }
}
