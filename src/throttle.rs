use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct BucketState {
    rate: u64,
    tokens: f64,
    last: Instant,
}

/// A token bucket measured in bytes.
///
/// The bucket holds at most one second worth of budget. [`consume`](Self::consume)
/// only computes how long the caller has to wait, so it composes with both
/// blocking and async sleeps. A rate of `0` disables throttling.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(bytes_per_second: u64) -> Self {
        Self {
            state: Mutex::new(BucketState {
                rate: bytes_per_second,
                tokens: bytes_per_second as f64,
                last: Instant::now(),
            }),
        }
    }

    pub fn set_rate(&self, bytes_per_second: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.rate = bytes_per_second;
        state.tokens = bytes_per_second as f64;
        state.last = Instant::now();
    }

    pub fn rate(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rate
    }

    /// Takes `bytes` out of the bucket and returns how long to wait before the
    /// consumption counts as admitted.
    pub fn consume(&self, bytes: usize) -> Duration {
        self.consume_at(bytes, Instant::now())
    }

    fn consume_at(&self, bytes: usize, now: Instant) -> Duration {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.rate == 0 {
            return Duration::ZERO;
        }
        let rate = state.rate as f64;

        let lapse = now.saturating_duration_since(state.last).as_secs_f64();
        state.last = now;
        state.tokens = (state.tokens + lapse * rate).min(rate);
        state.tokens -= bytes as f64;

        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / rate)
        }
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn zero_rate_is_unlimited() {
        let bucket = TokenBucket::new(0);
        assert_eq!(bucket.consume(usize::MAX), Duration::ZERO);
        assert_eq!(bucket.consume(1 << 30), Duration::ZERO);
    }

    #[test]
    fn waits_for_the_deficit() {
        let bucket = TokenBucket::new(1000);
        let now = Instant::now();

        // a full second of budget is available up front
        assert_eq!(bucket.consume_at(1000, now), Duration::ZERO);
        assert_eq!(bucket.consume_at(500, now), Duration::from_millis(500));
        // the deficit accumulates
        assert_eq!(bucket.consume_at(500, now), Duration::from_secs(1));
    }

    #[test]
    fn refills_over_time_but_caps_at_one_second() {
        let bucket = TokenBucket::new(1000);
        let start = Instant::now();
        assert_eq!(bucket.consume_at(1000, start), Duration::ZERO);

        let later = start + Duration::from_millis(250);
        assert_eq!(bucket.consume_at(250, later), Duration::ZERO);

        let much_later = later + Duration::from_secs(60);
        assert_eq!(bucket.consume_at(1000, much_later), Duration::ZERO);
        assert_eq!(bucket.consume_at(100, much_later), Duration::from_millis(100));
    }

    #[test]
    fn set_rate_resets_budget() {
        let bucket = TokenBucket::new(0);
        bucket.set_rate(2000);
        assert_eq!(bucket.rate(), 2000);
        let now = Instant::now();
        assert_eq!(bucket.consume_at(2000, now), Duration::ZERO);
        assert_eq!(bucket.consume_at(1000, now), Duration::from_millis(500));

        bucket.set_rate(0);
        assert_eq!(bucket.consume(1 << 20), Duration::ZERO);
    }

    #[test]
    fn shared_between_threads() {
        let bucket = Arc::new(TokenBucket::new(1_000_000));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| bucket.consume(10_000))
                        .max()
                        .unwrap_or_default()
                })
            })
            .collect();

        let max_wait = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .max()
            .unwrap();
        // 4MB against 1MB/s with 1MB of initial budget leaves roughly 3s of deficit
        assert!(max_wait > Duration::from_secs(2));
        assert!(max_wait <= Duration::from_secs(3));
    }
}
