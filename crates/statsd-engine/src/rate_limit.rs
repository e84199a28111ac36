// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Token bucket rate limiter.
//!
//! Knows nothing about what it protects: the parser stage uses one to bound
//! bad-line logging, the cloud lookup dispatcher uses one to bound provider
//! calls.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Refills continuously at `rate` tokens per second up to `burst` tokens.
/// Starts full.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    #[must_use]
    pub fn new(rate_per_second: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate: rate_per_second.max(0.0),
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// `per_minute` tokens per minute, with a burst of the same size.
    #[must_use]
    pub fn per_minute(per_minute: f64) -> Self {
        // burst is at least one token; saturating cast of a positive float
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let burst = per_minute.ceil().max(1.0) as u32;
        Self::new(per_minute / 60.0, burst)
    }

    /// Takes a token if one is available.
    pub fn try_acquire(&self) -> bool {
        self.reserve().is_ok()
    }

    /// Waits until a token is available and takes it.
    pub async fn acquire(&self) {
        while let Err(wait) = self.reserve() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Takes a token, or returns how long until one becomes available.
    fn reserve(&self) -> Result<(), Duration> {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock poisoned");
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return Ok(());
        }
        if self.rate <= 0.0 {
            // never refills; poll again much later
            return Err(Duration::from_secs(3600));
        }
        let missing = 1.0 - state.tokens;
        Err(Duration::from_secs_f64(missing / self.rate))
    }
}
