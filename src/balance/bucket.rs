//! Token-bucket admission control.
//!
//! Each backend carries one bucket sized from its catalog record:
//! `capacity` tokens of burst, refilled continuously at `refill_rate`
//! tokens per second. `allow` is called from every in-flight request that
//! samples the backend, so the state sits behind a short mutex rather than
//! the cache lock.

use std::time::Instant;

use parking_lot::Mutex;

/// A token bucket granting at most `capacity` tokens at once, replenished
/// at `refill_rate` tokens per second of monotonic time.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket. `rate` and `burst` come straight from the
    /// catalog record and are validated positive there.
    pub fn new(rate: u32, burst: u32) -> Self {
        Self {
            capacity: f64::from(burst),
            refill_rate: f64::from(rate),
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Try to consume one token. Returns `false` when the bucket is empty,
    /// in which case the caller moves on to the next backend.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();

        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.refill_rate)
            .min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("refill_rate", &self.refill_rate)
            .field("tokens", &self.state.lock().tokens)
            .finish()
    }
}
