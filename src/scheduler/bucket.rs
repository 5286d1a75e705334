//! Token bucket admission.

use std::time::Duration;

use tokio::time::Instant;

/// Slack for float drift after sleeping exactly one refill interval.
const EPSILON: f64 = 1e-9;

/// Single-consumer token bucket.
///
/// Tokens stay in `[0, capacity]`. They only grow through elapsed-time
/// refill and only shrink by exactly one per [`try_take`](Self::try_take).
#[derive(Debug)]
pub(crate) struct TokenBucket {
    tokens: f64,
    capacity: f64,
    interval: Duration,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket: the first request goes out immediately.
    pub(crate) fn new(capacity: f64, interval: Duration, now: Instant) -> Self {
        Self {
            tokens: capacity,
            capacity,
            interval,
            last_refill: now,
        }
    }

    pub(crate) fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let earned = elapsed.as_secs_f64() / self.interval.as_secs_f64();
        self.tokens = (self.tokens + earned).min(self.capacity);
        self.last_refill = now;
    }

    /// Refill, then take one token or report how long until one is due.
    pub(crate) fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens + EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            Ok(())
        } else {
            let missing = 1.0 - self.tokens;
            Err(self.interval.mul_f64(missing))
        }
    }

    pub(crate) fn tokens(&self) -> f64 {
        self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(4000);

    #[test]
    fn starts_full() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1.0, INTERVAL, now);
        assert!(bucket.try_take(now).is_ok());
        assert_eq!(bucket.tokens(), 0.0);
    }

    #[test]
    fn empty_bucket_reports_wait() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1.0, INTERVAL, now);
        bucket.try_take(now).unwrap();

        let wait = bucket.try_take(now + Duration::from_millis(1000)).unwrap_err();
        assert_eq!(wait, Duration::from_millis(3000));
    }

    #[test]
    fn refills_after_one_interval() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1.0, INTERVAL, now);
        bucket.try_take(now).unwrap();
        assert!(bucket.try_take(now + INTERVAL).is_ok());
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1.0, INTERVAL, now);
        bucket.refill(now + INTERVAL * 10);
        assert_eq!(bucket.tokens(), 1.0);

        bucket.try_take(now + INTERVAL * 10).unwrap();
        assert!(bucket.try_take(now + INTERVAL * 10).is_err());
    }

    #[test]
    fn larger_capacity_allows_bursts() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(3.0, INTERVAL, now);
        for _ in 0..3 {
            assert!(bucket.try_take(now).is_ok());
        }
        assert!(bucket.try_take(now).is_err());
    }
}
