//! Token bucket rate limiter
//!
//! Refill is computed lazily from elapsed time on `acquire`; nothing runs in
//! the background. The token count always stays within `[0, burst]`.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Refill time unit: `rate` is expressed in events per this unit
const TIME_UNIT: Duration = Duration::from_secs(1);

/// Thread-safe token bucket
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: u32,
    burst: u32,
    rate: u32,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: u32, burst: u32) -> Self {
        Self {
            tokens: burst,
            burst,
            rate,
            last_refill: Instant::now(),
        }
    }

    fn try_acquire(&mut self) -> bool {
        if self.tokens == 0 {
            let now = Instant::now();
            let elapsed = now.saturating_duration_since(self.last_refill);

            if elapsed >= TIME_UNIT {
                self.tokens = self.burst;
                let whole_units = (elapsed.as_nanos() / TIME_UNIT.as_nanos()) as u32;
                self.last_refill += TIME_UNIT * whole_units;
            } else {
                let earned =
                    elapsed.as_nanos() * self.rate as u128 / TIME_UNIT.as_nanos();
                if earned == 0 {
                    return false;
                }
                let earned = earned.min(self.burst as u128) as u32;
                self.tokens = earned;
                // Advance only by the time that paid for the granted tokens
                let paid = TIME_UNIT.as_nanos() * earned as u128 / self.rate as u128;
                self.last_refill += Duration::from_nanos(paid as u64);
            }

            if self.tokens == 0 {
                return false;
            }
        }

        self.tokens -= 1;
        true
    }

    fn put(&mut self) {
        if self.tokens < self.burst {
            self.tokens += 1;
        }
    }
}

impl RateLimiter {
    /// Create a full bucket with `burst` capacity refilled at `rate` per second
    pub fn new(rate: u32, burst: u32) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(rate, burst)),
        }
    }

    /// Take one token. Returns false when the caller is rate limited.
    pub fn acquire(&self) -> bool {
        self.bucket.lock().unwrap().try_acquire()
    }

    /// Give a token back (undo of a successful `acquire`), capped at `burst`
    pub fn release(&self) {
        self.bucket.lock().unwrap().put();
    }

    /// Reconfigure in place; the bucket starts full again
    pub fn update(&self, rate: u32, burst: u32) {
        let mut bucket = self.bucket.lock().unwrap();
        *bucket = TokenBucket::new(rate, burst);
    }

    /// Tokens currently available (without refilling)
    pub fn tokens(&self) -> u32 {
        self.bucket.lock().unwrap().tokens
    }

    pub fn burst(&self) -> u32 {
        self.bucket.lock().unwrap().burst
    }

    pub fn rate(&self) -> u32 {
        self.bucket.lock().unwrap().rate
    }
}
