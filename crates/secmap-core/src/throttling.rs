//! Global outbound-rate cap shared by every lookup of a run.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

const MIN_RATE_PER_SEC: f64 = 0.01;
const MIN_WAIT: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, burst: f64) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(burst);
    }
}

/// Token bucket whose refill rate can be changed while callers are waiting.
///
/// Tokens are real-valued, replenished lazily on every access and never exceed
/// the burst capacity. The bucket starts full.
#[derive(Debug)]
pub struct TokenBucket {
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                rate_per_sec: rate_per_sec.max(MIN_RATE_PER_SEC),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Takes one token if available. Otherwise returns how long until one
    /// token will have accumulated at the current rate.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self
            .state
            .lock()
            .expect("token bucket lock is not poisoned");
        state.refill(self.burst);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return Ok(());
        }

        let needed = 1.0 - state.tokens;
        let wait = Duration::from_secs_f64(needed / state.rate_per_sec);
        Err(wait.max(MIN_WAIT))
    }

    /// Waits until a token is available and consumes it.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Changes the refill rate from now on. Tokens accumulated at the old rate
    /// are kept.
    pub fn set_rate(&self, rate_per_sec: f64) {
        let mut state = self
            .state
            .lock()
            .expect("token bucket lock is not poisoned");
        state.refill(self.burst);
        state.rate_per_sec = rate_per_sec.max(MIN_RATE_PER_SEC);
    }

    pub fn rate(&self) -> f64 {
        self.state
            .lock()
            .expect("token bucket lock is not poisoned")
            .rate_per_sec
    }

    /// Currently available tokens, after refilling.
    pub fn tokens(&self) -> f64 {
        let mut state = self
            .state
            .lock()
            .expect("token bucket lock is not poisoned");
        state.refill(self.burst);
        state.tokens
    }

    pub fn burst(&self) -> f64 {
        self.burst
    }
}
