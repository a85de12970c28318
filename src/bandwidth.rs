//! Bandwidth limiting using a token bucket.
//!
//! Wire framing charges every network chunk against an optional
//! [`RateLimiter`]; the call completes once enough tokens are available.
//!
//! # Example
//!
//! ```
//! use peerwire::bandwidth::RateLimiterPair;
//!
//! # async fn example() {
//! // 1MB/s download, unlimited upload
//! let limiters = RateLimiterPair::new(1_000_000, 0);
//!
//! limiters.download().acquire(16384).await;
//! limiters.upload().acquire(16384).await;
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Semaphore;

/// A token bucket rate limiter.
///
/// Tokens accrue at a fixed rate up to twice the per-second rate. An
/// acquisition that exceeds the available tokens sleeps for the deficit.
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
    // Serializes waiters so a large request is not starved by small ones.
    turn: Semaphore,
}

struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    tokens_per_sec: f64,
    last_update: Instant,
    unlimited: bool,
}

impl TokenBucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.last_update = now;
        self.tokens = (self.tokens + elapsed * self.tokens_per_sec).min(self.max_tokens);
    }

    fn take(&mut self, bytes: usize) -> Duration {
        if self.unlimited {
            return Duration::ZERO;
        }

        self.refill(Instant::now());

        let wanted = bytes as f64;
        if self.tokens >= wanted {
            self.tokens -= wanted;
            Duration::ZERO
        } else {
            let deficit = wanted - self.tokens;
            self.tokens = 0.0;
            Duration::from_secs_f64(deficit / self.tokens_per_sec)
        }
    }
}

impl RateLimiter {
    /// Creates a limiter allowing `bytes_per_sec`. A rate of 0 is unlimited.
    pub fn new(bytes_per_sec: u64) -> Arc<Self> {
        if bytes_per_sec == 0 {
            return Self::unlimited();
        }
        let max_tokens = (bytes_per_sec * 2) as f64;
        Arc::new(Self {
            bucket: Mutex::new(TokenBucket {
                tokens: max_tokens,
                max_tokens,
                tokens_per_sec: bytes_per_sec as f64,
                last_update: Instant::now(),
                unlimited: false,
            }),
            turn: Semaphore::new(1),
        })
    }

    /// Creates a limiter that never delays.
    pub fn unlimited() -> Arc<Self> {
        Arc::new(Self {
            bucket: Mutex::new(TokenBucket {
                tokens: 0.0,
                max_tokens: 0.0,
                tokens_per_sec: 0.0,
                last_update: Instant::now(),
                unlimited: true,
            }),
            turn: Semaphore::new(1),
        })
    }

    /// Changes the rate. A rate of 0 removes the limit.
    pub fn set_rate(&self, bytes_per_sec: u64) {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        bucket.unlimited = bytes_per_sec == 0;
        bucket.tokens_per_sec = bytes_per_sec as f64;
        bucket.max_tokens = (bytes_per_sec * 2) as f64;
        bucket.tokens = bucket.tokens.min(bucket.max_tokens);
    }

    pub fn is_unlimited(&self) -> bool {
        self.bucket.lock().unlimited
    }

    /// Waits until `bytes` may be transferred.
    pub async fn acquire(&self, bytes: usize) {
        let wait = {
            // The semaphore is never closed.
            let _turn = self.turn.acquire().await.ok();
            self.bucket.lock().take(bytes)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Upload and download limiters for one torrent.
#[derive(Clone)]
pub struct RateLimiterPair {
    download: Arc<RateLimiter>,
    upload: Arc<RateLimiter>,
}

impl RateLimiterPair {
    /// Creates limiters with the given rates. A rate of 0 is unlimited.
    pub fn new(download_limit: u64, upload_limit: u64) -> Self {
        Self {
            download: RateLimiter::new(download_limit),
            upload: RateLimiter::new(upload_limit),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    pub fn download(&self) -> &Arc<RateLimiter> {
        &self.download
    }

    pub fn upload(&self) -> &Arc<RateLimiter> {
        &self.upload
    }
}

impl Default for RateLimiterPair {
    fn default() -> Self {
        Self::unlimited()
    }
}
