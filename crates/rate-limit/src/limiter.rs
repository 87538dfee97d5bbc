//! Sliding window admission for a single counter key.

use std::{sync::Arc, time::Duration};

use uuid::Uuid;

use crate::{
    error::CheckError,
    storage::{CounterStore, WindowRequest},
};

/// Outcome of one sliding window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCheck {
    /// Requests in the window after this check.
    pub count: u64,
    /// The limit the window was checked against.
    pub limit: u32,
    /// Whether the request was admitted and recorded.
    pub admitted: bool,
}

impl WindowCheck {
    /// Requests left in the window.
    pub fn remaining(&self) -> u64 {
        u64::from(self.limit).saturating_sub(self.count)
    }
}

/// Sliding window limiter over a shared counter store.
///
/// Each key holds the timestamps of the admitted requests in the trailing
/// window. Eviction, counting and recording happen in one atomic store call,
/// so concurrent callers on the same key never over-admit.
pub struct SlidingWindowLimiter<S> {
    store: Arc<S>,
}

impl<S> Clone for SlidingWindowLimiter<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: CounterStore> SlidingWindowLimiter<S> {
    /// Creates a limiter on top of the given store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Checks the window of `key` and records the request if it fits.
    ///
    /// A `max_requests` of zero denies every request.
    pub async fn check(
        &self,
        key: &str,
        window_seconds: u64,
        max_requests: u32,
        now_ms: i64,
    ) -> Result<WindowCheck, CheckError> {
        let window_ms = window_millis(window_seconds)?;

        let request = WindowRequest {
            now_ms,
            window_ms,
            max_requests,
            // Requests in the same millisecond must stay distinct samples.
            member: format!("{now_ms}-{}", Uuid::new_v4().simple()),
            ttl: Duration::from_secs(window_seconds.saturating_add(1)),
        };

        let result = self.store.check_and_record(key, &request).await?;

        log::debug!(
            "Window check for {key}: count={}, limit={max_requests}, admitted={}",
            result.count,
            result.admitted
        );

        Ok(WindowCheck {
            count: result.count,
            limit: max_requests,
            admitted: result.admitted,
        })
    }

    /// Counts the requests currently in the window of `key` without recording anything.
    pub async fn peek(&self, key: &str, window_seconds: u64, now_ms: i64) -> Result<u64, CheckError> {
        let window_ms = window_millis(window_seconds)?;
        let count = self.store.count_in_window(key, window_ms, now_ms).await?;

        Ok(count)
    }

    /// Drops the windows of the given keys, returning how many existed.
    pub async fn reset(&self, keys: &[String]) -> Result<u64, CheckError> {
        Ok(self.store.delete(keys).await?)
    }
}

fn window_millis(window_seconds: u64) -> Result<i64, CheckError> {
    if window_seconds == 0 {
        return Err(CheckError::InvalidWindow);
    }

    i64::try_from(window_seconds)
        .ok()
        .and_then(|seconds| seconds.checked_mul(1000))
        .ok_or(CheckError::InvalidWindow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    fn limiter() -> SlidingWindowLimiter<InMemoryStorage> {
        SlidingWindowLimiter::new(Arc::new(InMemoryStorage::new()))
    }

    #[tokio::test]
    async fn fills_then_denies() {
        let limiter = limiter();

        for expected in 1..=5 {
            let check = limiter.check("rl:ip:10.0.0.1:/login", 60, 5, 0).await.unwrap();

            assert_eq!(
                check,
                WindowCheck {
                    count: expected,
                    limit: 5,
                    admitted: true
                }
            );
        }

        let check = limiter.check("rl:ip:10.0.0.1:/login", 60, 5, 10_000).await.unwrap();

        assert_eq!(
            check,
            WindowCheck {
                count: 5,
                limit: 5,
                admitted: false
            }
        );
        assert_eq!(check.remaining(), 0);
    }

    #[tokio::test]
    async fn window_slides_past_old_samples() {
        let limiter = limiter();

        for _ in 0..5 {
            limiter.check("k", 60, 5, 0).await.unwrap();
        }

        let check = limiter.check("k", 60, 5, 61_000).await.unwrap();

        assert_eq!(
            check,
            WindowCheck {
                count: 1,
                limit: 5,
                admitted: true
            }
        );
    }

    #[tokio::test]
    async fn denied_requests_are_not_recorded() {
        let limiter = limiter();

        limiter.check("k", 60, 2, 0).await.unwrap();
        limiter.check("k", 60, 2, 1_000).await.unwrap();

        for now in [2_000, 3_000, 4_000] {
            let check = limiter.check("k", 60, 2, now).await.unwrap();
            assert!(!check.admitted);
        }

        assert_eq!(limiter.peek("k", 60, 4_000).await.unwrap(), 2);

        // Once the first sample expires, exactly one slot opens up.
        let check = limiter.check("k", 60, 2, 60_500).await.unwrap();
        assert!(check.admitted);
        assert_eq!(check.count, 2);
    }

    #[tokio::test]
    async fn same_millisecond_requests_stay_distinct() {
        let limiter = limiter();

        let first = limiter.check("k", 60, 2, 1_000).await.unwrap();
        let second = limiter.check("k", 60, 2, 1_000).await.unwrap();

        assert_eq!(first.count, 1);
        assert_eq!(second.count, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_on_one_key_admit_once() {
        let limiter = limiter();

        let (a, b) = tokio::join!(limiter.check("k", 60, 1, 5_000), limiter.check("k", 60, 1, 5_000));
        let admitted = [a.unwrap(), b.unwrap()].iter().filter(|c| c.admitted).count();

        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn zero_limit_always_denies() {
        let limiter = limiter();

        let check = limiter.check("k", 60, 0, 0).await.unwrap();

        assert!(!check.admitted);
        assert_eq!(check.count, 0);
    }

    #[tokio::test]
    async fn zero_window_is_rejected() {
        let limiter = limiter();

        assert!(matches!(
            limiter.check("k", 0, 5, 0).await,
            Err(CheckError::InvalidWindow)
        ));
        assert!(matches!(limiter.peek("k", 0, 0).await, Err(CheckError::InvalidWindow)));
    }

    #[tokio::test]
    async fn peek_does_not_change_outcomes() {
        let limiter = limiter();

        limiter.check("k", 60, 2, 0).await.unwrap();

        for _ in 0..10 {
            assert_eq!(limiter.peek("k", 60, 1_000).await.unwrap(), 1);
        }

        assert!(limiter.check("k", 60, 2, 1_000).await.unwrap().admitted);
        assert!(!limiter.check("k", 60, 2, 1_000).await.unwrap().admitted);
    }

    #[tokio::test]
    async fn never_over_admits_in_any_trailing_window() {
        let limiter = limiter();
        let mut admitted = Vec::new();

        // Bursty traffic: clusters of requests with irregular gaps.
        let mut now = 0i64;
        for i in 0..400i64 {
            now += if i % 7 == 0 { 4_000 } else { 150 + (i * 37) % 900 };

            if limiter.check("k", 10, 4, now).await.unwrap().admitted {
                admitted.push(now);
            }
        }

        for (i, &end) in admitted.iter().enumerate() {
            let in_window = admitted[..=i].iter().filter(|&&t| t > end - 10_000).count();
            assert!(in_window <= 4, "{in_window} admissions in the window ending at {end}");
        }
    }

    #[tokio::test]
    async fn reset_clears_the_window() {
        let limiter = limiter();

        limiter.check("k", 60, 1, 0).await.unwrap();
        assert_eq!(limiter.reset(&["k".to_string(), "missing".to_string()]).await.unwrap(), 1);
        assert!(limiter.check("k", 60, 1, 0).await.unwrap().admitted);
    }
}
