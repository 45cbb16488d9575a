//! Retry rate limiting for the work queue
//!
//! Failed items re-enter the queue through a two-tier limiter: a per-item
//! exponential backoff so one broken request cannot hot-loop, and a global
//! token bucket so a flood of failures cannot saturate the API server. The
//! effective delay is the maximum of the two.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Base delay for the per-item exponential backoff
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(200);

/// Ceiling for the per-item exponential backoff
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Sustained requeue rate allowed by the global token bucket
pub const DEFAULT_QPS: f64 = 10.0;

/// Burst size allowed by the global token bucket
pub const DEFAULT_BURST: u32 = 100;

/// Decides how long a failed item waits before it may requeue
pub trait RateLimiter<T>: Send + Sync {
    /// Delay before `item` may be re-added, recording one more failure
    fn when(&self, item: &T) -> Duration;

    /// Clear failure tracking for `item` after a successful sync
    fn forget(&self, item: &T);

    /// Number of failures recorded for `item`
    fn retries(&self, item: &T) -> u32;
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`
pub struct ItemExponentialBackoff<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<T, u32>>,
}

impl<T> ItemExponentialBackoff<T> {
    /// Create a backoff limiter with the given base delay and ceiling
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Eq + Hash + Clone + Send> RateLimiter<T> for ItemExponentialBackoff<T> {
    fn when(&self, item: &T) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(item.clone()).or_insert(0);
        let exp = *count;
        *count += 1;

        let backoff = self.base.as_secs_f64() * 2f64.powi(exp.min(1024) as i32);
        if backoff > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(backoff)
        }
    }

    fn forget(&self, item: &T) {
        self.failures.lock().remove(item);
    }

    fn retries(&self, item: &T) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or(0)
    }
}

struct BucketState {
    tokens: f64,
    last: Instant,
}

/// Global token bucket shared across all items
///
/// Tokens replenish at `qps` up to `burst`. Exhausting the bucket hands out
/// delays that keep the long-run requeue rate at `qps`, reserving tokens in
/// the future the way a reservation-based limiter does.
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket allowing `qps` sustained with bursts of `burst`
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: f64::from(burst),
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                last: Instant::now(),
            }),
        }
    }
}

impl<T> RateLimiter<T> for TokenBucket {
    fn when(&self, _item: &T) -> Duration {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.qps).min(self.burst);
        state.last = now;
        state.tokens -= 1.0;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.qps)
        }
    }

    fn forget(&self, _item: &T) {}

    fn retries(&self, _item: &T) -> u32 {
        0
    }
}

/// Combines limiters by taking the worst (longest) delay
///
/// `forget` is forwarded to every part, `retries` reports the highest count.
pub struct MaxOf<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOf<T> {
    /// Combine the given limiters
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOf<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn retries(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.retries(item))
            .max()
            .unwrap_or(0)
    }
}

/// The default two-tier limiter used by the certificate controller
pub fn default_controller_rate_limiter<T>() -> MaxOf<T>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    MaxOf::new(vec![
        Box::new(ItemExponentialBackoff::new(
            DEFAULT_BASE_DELAY,
            DEFAULT_MAX_DELAY,
        )),
        Box::new(TokenBucket::new(DEFAULT_QPS, DEFAULT_BURST)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Duration);

    impl<T> RateLimiter<T> for Fixed {
        fn when(&self, _item: &T) -> Duration {
            self.0
        }
        fn forget(&self, _item: &T) {}
        fn retries(&self, _item: &T) -> u32 {
            0
        }
    }

    #[test]
    fn backoff_doubles_per_item_up_to_the_cap() {
        let limiter = ItemExponentialBackoff::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY);
        let key = "csr-1";

        assert_eq!(limiter.when(&key), Duration::from_millis(200));
        assert_eq!(limiter.when(&key), Duration::from_millis(400));
        assert_eq!(limiter.when(&key), Duration::from_millis(800));

        let mut last = Duration::ZERO;
        for _ in 0..40 {
            let delay = limiter.when(&key);
            assert!(delay >= last, "delays must never shrink");
            last = delay;
        }
        assert_eq!(last, DEFAULT_MAX_DELAY);
    }

    #[test]
    fn backoff_tracks_items_independently() {
        let limiter = ItemExponentialBackoff::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY);
        limiter.when(&"a");
        limiter.when(&"a");
        assert_eq!(limiter.when(&"b"), Duration::from_millis(200));
        assert_eq!(limiter.retries(&"a"), 2);
        assert_eq!(limiter.retries(&"b"), 1);
    }

    #[test]
    fn forget_resets_the_backoff() {
        let limiter = ItemExponentialBackoff::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY);
        limiter.when(&"a");
        limiter.when(&"a");
        limiter.forget(&"a");
        assert_eq!(limiter.retries(&"a"), 0);
        assert_eq!(limiter.when(&"a"), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_allows_burst_then_spaces_out() {
        let bucket = TokenBucket::new(1.0, 2);

        assert_eq!(RateLimiter::<&str>::when(&bucket, &"x"), Duration::ZERO);
        assert_eq!(RateLimiter::<&str>::when(&bucket, &"x"), Duration::ZERO);

        // bucket empty, reservations move into the future at 1 qps
        assert_eq!(RateLimiter::<&str>::when(&bucket, &"x"), Duration::from_secs(1));
        assert_eq!(RateLimiter::<&str>::when(&bucket, &"x"), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_replenishes_over_time() {
        let bucket = TokenBucket::new(1.0, 1);
        assert_eq!(RateLimiter::<&str>::when(&bucket, &"x"), Duration::ZERO);
        assert_eq!(RateLimiter::<&str>::when(&bucket, &"x"), Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(RateLimiter::<&str>::when(&bucket, &"x"), Duration::ZERO);
    }

    #[test]
    fn max_of_takes_the_longest_delay() {
        let limiter: MaxOf<&str> = MaxOf::new(vec![
            Box::new(Fixed(Duration::from_millis(50))),
            Box::new(Fixed(Duration::from_secs(3))),
        ]);
        assert_eq!(limiter.when(&"x"), Duration::from_secs(3));
    }

    #[test]
    fn default_limiter_starts_at_the_backoff_base() {
        let limiter = default_controller_rate_limiter::<String>();
        // fresh limiter: bucket is full, so the backoff base dominates
        assert_eq!(limiter.when(&"csr-1".to_string()), DEFAULT_BASE_DELAY);
        assert_eq!(limiter.retries(&"csr-1".to_string()), 1);
    }
}
