//! Test helpers for timing-sensitive tests
//!
//! The sessions under test run on real timers with short timings, so
//! assertions poll for a condition instead of sleeping a fixed amount.

use std::time::Duration;

/// Check if running in a CI environment
///
/// Checks common CI environment variables.
pub fn is_ci_environment() -> bool {
    std::env::var("CI").is_ok()
        || std::env::var("GITHUB_ACTIONS").is_ok()
        || std::env::var("GITLAB_CI").is_ok()
}

/// Get CI-adjusted timeout duration
///
/// Returns a timeout that's longer in CI environments to account for
/// resource contention and slower machines.
pub fn ci_timeout(base_timeout: Duration) -> Duration {
    if is_ci_environment() {
        base_timeout.mul_f32(3.0)
    } else {
        base_timeout.mul_f32(1.5)
    }
}

/// Poll `condition` every 10 ms until it holds or `timeout` (CI-adjusted)
/// elapses. Returns whether it held.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + ci_timeout(timeout);
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_ci_timeout() {
        let base = Duration::from_secs(10);
        let adjusted = ci_timeout(base);

        if is_ci_environment() {
            assert_eq!(adjusted, Duration::from_secs(30));
        } else {
            assert_eq!(adjusted, Duration::from_secs(15));
        }
    }

    #[tokio::test]
    async fn test_wait_until() {
        let polls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&polls);
        assert!(wait_until(Duration::from_secs(1), move || counter.fetch_add(1, Ordering::SeqCst) >= 3).await);
        assert!(polls.load(Ordering::SeqCst) >= 4);

        assert!(!wait_until(Duration::from_millis(20), || false).await);
    }
}
