//! Token bucket shared by the DNS-serving transports.

use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, Quota};

/// Process-wide rate limiter.
///
/// Refills `rate` tokens per second up to `burst`. Checking never blocks.
pub struct RateLimiter {
    inner: DefaultDirectRateLimiter,
}

impl RateLimiter {
    pub fn new(rate: NonZeroU32, burst: NonZeroU32) -> Self {
        let quota = Quota::per_second(rate).allow_burst(burst);

        Self {
            inner: DefaultDirectRateLimiter::direct(quota),
        }
    }

    /// Consume one token if available.
    pub fn allow(&self) -> bool {
        self.inner.check().is_ok()
    }
}
