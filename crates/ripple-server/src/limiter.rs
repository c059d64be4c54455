//! Handshake rate limiting.
//!
//! A token bucket bounds how fast new WebSocket upgrades are accepted;
//! excess handshakes are answered with HTTP 429 before any upgrade work.

use std::sync::Mutex;

use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket refilled continuously at `rate` per second, holding at
/// most `burst` tokens.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    rate: f64,
    burst: f64,
}

impl TokenBucket {
    #[must_use]
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
            rate,
            burst,
        }
    }

    /// Build the handshake limiter from configuration.
    ///
    /// A negative rate disables limiting entirely; zero values select the
    /// defaults (100/s, burst 50).
    #[must_use]
    pub fn from_config(rate: f64, burst: u32) -> Option<Self> {
        if rate < 0.0 {
            return None;
        }
        let rate = if rate == 0.0 { 100.0 } else { rate };
        let burst = if burst == 0 { 50 } else { burst };
        Some(Self::new(rate, burst))
    }

    /// Take one token if available.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
