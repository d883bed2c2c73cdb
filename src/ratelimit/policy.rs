//! Bucket policy shared by every client of a registry.

use crate::error::{FinGateError, Result};

/// Refill rate and burst capacity applied to every client bucket.
///
/// A registry holds exactly one policy; clients with different limits
/// need different registries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitPolicy {
    /// Tokens added per second
    requests_per_second: f64,
    /// Maximum tokens a bucket can hold
    burst: u32,
}

impl RateLimitPolicy {
    /// Create a validated policy.
    ///
    /// `requests_per_second` must be finite and strictly positive. A `burst`
    /// of zero is accepted and denies every request.
    pub fn new(requests_per_second: f64, burst: u32) -> Result<Self> {
        if !requests_per_second.is_finite() || requests_per_second <= 0.0 {
            return Err(FinGateError::Config(format!(
                "requests_per_second must be a positive number, got {}",
                requests_per_second
            )));
        }

        Ok(Self {
            requests_per_second,
            burst,
        })
    }

    pub fn requests_per_second(&self) -> f64 {
        self.requests_per_second
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Seconds after which the next token is guaranteed, `ceil(1 / rps)`.
    ///
    /// Never less than one so clients always get a usable hint.
    pub fn retry_after_secs(&self) -> u64 {
        (1.0 / self.requests_per_second).ceil().max(1.0) as u64
    }
}
