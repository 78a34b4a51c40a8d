//! Local token bucket gating outbound provider calls.
//!
//! Refills at the configured requests-per-second with burst capacity of
//! twice the rate. Acquire waits for a token, bounded by the caller's
//! deadline; exceeding it is a retryable `rate-limit-exceeded`.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{DncError, DncResult};
use crate::model::RateLimitInfo;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    /// Bucket at `rps` tokens per second, burst `2 * rps`.
    pub fn new(rps: u32) -> Self {
        let rate = f64::from(rps.max(1));
        let burst = rate * 2.0;
        Self {
            rate,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn info(&self) -> RateLimitInfo {
        RateLimitInfo {
            requests_per_second: self.rate as u32,
            burst: self.burst as u32,
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = Instant::now();
    }

    /// Whether a token is available right now, without consuming one.
    /// Used by health reports.
    pub fn try_peek(&self) -> bool {
        let mut bucket = self.bucket.lock().unwrap();
        self.refill(&mut bucket);
        bucket.tokens >= 1.0
    }

    /// Take a token without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().unwrap();
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait for a token, giving up at `deadline`.
    pub async fn acquire(&self, deadline: Duration) -> DncResult<()> {
        let started = Instant::now();
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().unwrap();
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate)
            };

            if started.elapsed() + wait > deadline {
                return Err(DncError::RateLimitExceeded(format!(
                    "no token within deadline of {deadline:?}"
                )));
            }
            tokio::time::sleep(wait).await;
        }
    }
}
