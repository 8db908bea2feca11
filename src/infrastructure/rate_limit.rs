//! Outbound rate limiting
//!
//! Optional admission control for `Connection::send_message`. The limiter is
//! injected through `ConnectionConfig`; callers that need a different policy
//! implement `RateLimiter` themselves.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Admission decision for one outbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Send immediately
    Granted,
    /// Wait at least this long, then ask again
    Delayed(Duration),
    /// Drop the request with a rate-limit error
    Rejected,
}

/// Admission control for outbound frames
pub trait RateLimiter: Send + Sync + fmt::Debug {
    /// Decide whether one frame may be sent now
    fn admit(&self) -> Admission;
}

/// Token bucket limiter
///
/// Refills continuously at `rate_per_sec` up to `burst` tokens. When the
/// bucket is empty the limiter either delays the caller until the next token
/// or rejects outright, depending on the mode it was built with.
#[derive(Debug)]
pub struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    reject_on_empty: bool,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    /// Limiter that delays callers while the bucket refills
    pub fn new(rate_per_sec: f64, burst: usize) -> Self {
        Self::build(rate_per_sec, burst, false)
    }

    /// Limiter that rejects callers while the bucket is empty
    pub fn strict(rate_per_sec: f64, burst: usize) -> Self {
        Self::build(rate_per_sec, burst, true)
    }

    fn build(rate_per_sec: f64, burst: usize, reject_on_empty: bool) -> Self {
        let burst = (burst.max(1)) as f64;
        Self {
            rate_per_sec: rate_per_sec.max(f64::MIN_POSITIVE),
            burst,
            reject_on_empty,
            state: Mutex::new(BucketState {
                tokens: burst,
                refilled_at: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.burst);
        state.refilled_at = now;
    }
}

impl RateLimiter for TokenBucket {
    fn admit(&self) -> Admission {
        let mut state = self.state.lock();
        self.refill(&mut state);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return Admission::Granted;
        }

        if self.reject_on_empty {
            return Admission::Rejected;
        }

        let deficit = 1.0 - state.tokens;
        Admission::Delayed(Duration::from_secs_f64(deficit / self.rate_per_sec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_is_granted() {
        let limiter = TokenBucket::new(1.0, 3);

        assert_eq!(limiter.admit(), Admission::Granted);
        assert_eq!(limiter.admit(), Admission::Granted);
        assert_eq!(limiter.admit(), Admission::Granted);

        match limiter.admit() {
            Admission::Delayed(wait) => assert!(wait <= Duration::from_secs(1)),
            other => panic!("expected delay, got {:?}", other),
        }
    }

    #[test]
    fn test_strict_rejects_when_empty() {
        let limiter = TokenBucket::strict(0.1, 1);

        assert_eq!(limiter.admit(), Admission::Granted);
        assert_eq!(limiter.admit(), Admission::Rejected);
    }

    #[test]
    fn test_refill_restores_tokens() {
        let limiter = TokenBucket::new(1000.0, 1);

        assert_eq!(limiter.admit(), Admission::Granted);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(limiter.admit(), Admission::Granted);
    }
}
