//! Token-bucket rate limiter.
//!
//! Capacity C with continuous refill at C / window per millisecond; starts
//! full, so a leading burst up to C is allowed, after which throughput
//! settles at the sustained rate. Process-local: one bucket per broadcaster
//! process, threaded in explicitly so tests can substitute their own.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Longest single sleep while waiting for tokens.
const MAX_SLEEP_SLICE: Duration = Duration::from_millis(250);

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket with blocking acquisition.
pub struct TokenBucket {
    capacity: f64,
    refill_per_ms: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket with `capacity` tokens refilled over `window`.
    /// Starts full.
    pub fn new(capacity: u32, window: Duration) -> Self {
        let capacity = capacity as f64;
        let window_ms = window.as_millis().max(1) as f64;
        Self {
            capacity,
            refill_per_ms: capacity / window_ms,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(state: &mut BucketState, capacity: f64, refill_per_ms: f64) {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(state.last_refill).as_secs_f64() * 1000.0;
        state.tokens = (state.tokens + elapsed_ms * refill_per_ms).min(capacity);
        state.last_refill = now;
    }

    /// Take `n` tokens without blocking, if available.
    pub fn try_take(&self, n: u32) -> bool {
        let mut state = self.state.lock();
        Self::refill(&mut state, self.capacity, self.refill_per_ms);
        if state.tokens >= n as f64 {
            state.tokens -= n as f64;
            true
        } else {
            false
        }
    }

    /// Take `n` tokens, sleeping cooperatively (in slices of at most 250 ms)
    /// until they have accrued.
    pub async fn take(&self, n: u32) {
        loop {
            let deficit = {
                let mut state = self.state.lock();
                Self::refill(&mut state, self.capacity, self.refill_per_ms);
                if state.tokens >= n as f64 {
                    state.tokens -= n as f64;
                    return;
                }
                n as f64 - state.tokens
            };

            let wait_ms = deficit / self.refill_per_ms;
            let wait = Duration::from_secs_f64(wait_ms / 1000.0).min(MAX_SLEEP_SLICE);
            // Never spin: even a sub-millisecond deficit sleeps at least once.
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Tokens currently available (after refill).
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        Self::refill(&mut state, self.capacity, self.refill_per_ms);
        state.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn initial_burst_up_to_capacity() {
        let bucket = TokenBucket::new(10, Duration::from_millis(1000));
        for _ in 0..10 {
            assert!(bucket.try_take(1));
        }
        assert!(!bucket.try_take(1));
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_continuous() {
        let bucket = TokenBucket::new(10, Duration::from_millis(1000));
        assert!(bucket.try_take(10));

        // Half a window refills half the capacity.
        tokio::time::advance(Duration::from_millis(500)).await;
        let available = bucket.available();
        assert!((available - 5.0).abs() < 0.5, "available = {available}");
    }

    #[tokio::test(start_paused = true)]
    async fn take_blocks_until_tokens_accrue() {
        let bucket = TokenBucket::new(10, Duration::from_millis(1000));
        assert!(bucket.try_take(10));

        let start = Instant::now();
        bucket.take(5).await;
        let waited = start.elapsed();

        // 5 tokens need ~500 ms at 10 tokens/s.
        assert!(waited >= Duration::from_millis(400), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(800), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_rate_is_bounded() {
        // Capacity 500 over 3000 ms, as deployed.
        let bucket = TokenBucket::new(500, Duration::from_millis(3000));

        let start = Instant::now();
        // Burst the full capacity, then 500 more.
        for _ in 0..1000 {
            bucket.take(1).await;
        }
        let elapsed = start.elapsed();

        // The second 500 can only come from refill: at least one full window.
        assert!(elapsed >= Duration::from_millis(2990), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn rolling_window_never_exceeds_capacity() {
        let bucket = TokenBucket::new(50, Duration::from_millis(1000));

        // Greedily take for exactly one window and count grants.
        let start = Instant::now();
        let mut granted = 0u32;
        while start.elapsed() < Duration::from_millis(1000) {
            if bucket.try_take(1) {
                granted += 1;
            } else {
                tokio::time::advance(Duration::from_millis(5)).await;
            }
        }

        // One window admits the initial burst plus one window of refill.
        assert!(granted <= 100, "granted {granted}");
        assert!(granted >= 95, "granted {granted}");
    }
}
