//! Token bucket implementation.

use std::time::{Duration, Instant};

use super::policy::RateLimitPolicy;

/// A continuously refilling token bucket for a single client.
///
/// The bucket itself is not synchronized; callers that share it wrap it in
/// a lock so that refill and consumption happen as one step.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Tokens added per second
    refill_rate: f64,
    /// Maximum number of tokens
    capacity: u32,
    /// Current level, always within `[0, capacity]`
    tokens: f64,
    /// Last time tokens were added
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    ///
    /// Negative or NaN rates are treated as zero, which freezes refill.
    pub fn new(refill_rate: f64, capacity: u32, now: Instant) -> Self {
        Self {
            refill_rate: refill_rate.max(0.0),
            capacity,
            tokens: capacity as f64,
            last_refill: now,
        }
    }

    /// Create a full bucket following a registry policy.
    pub fn from_policy(policy: &RateLimitPolicy, now: Instant) -> Self {
        Self::new(policy.requests_per_second(), policy.burst(), now)
    }

    /// Refill for the time elapsed since the last call, then try to take
    /// one token.
    ///
    /// Returns `true` if the token was taken, `false` if the bucket holds
    /// less than one token (nothing is consumed in that case).
    pub fn allow(&mut self, now: Instant) -> bool {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Get the current token level as of the last refill.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Get the capacity of this bucket.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Get the refill rate in tokens per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Time until one full token is available, measured from the last refill.
    ///
    /// Returns `None` when the bucket can never produce a token again, or
    /// the wait does not fit in a `Duration`.
    pub fn time_until_available(&self) -> Option<Duration> {
        let deficit = 1.0 - self.tokens;
        if deficit <= 0.0 {
            return Some(Duration::ZERO);
        }
        if self.refill_rate == 0.0 || self.capacity == 0 {
            return None;
        }
        Duration::try_from_secs_f64(deficit / self.refill_rate).ok()
    }

    /// Add tokens for the elapsed time. Clock skew counts as zero elapsed
    /// time and never moves `last_refill` backwards.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }

        let added = elapsed.as_secs_f64() * self.refill_rate;
        self.tokens = (self.tokens + added).min(self.capacity as f64);
        self.last_refill = now;
    }
}
