//! Reconnect backoff: exponential growth, jitter, hard cap.
//!
//! The delay for the k-th consecutive failure is drawn from
//! `[ceiling(k-1), ceiling(k)]`, where `ceiling(k) = min(base * 2^(k-1), cap)`.
//! Because consecutive windows only touch at their shared boundary, the
//! sequence of delays is non-decreasing for every possible draw.

use rand::Rng;
use std::time::Duration;

/// Largest exponent applied; keeps the multiplication far from overflow.
const MAX_EXPONENT: u32 = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    base_ms: u64,
    cap_ms: u64,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        let base_ms = (base.as_millis() as u64).max(1);
        let cap_ms = (cap.as_millis() as u64).max(base_ms);
        Self { base_ms, cap_ms }
    }

    pub fn cap(&self) -> Duration {
        Duration::from_millis(self.cap_ms)
    }

    /// Upper bound of the delay window after `failures` consecutive failures.
    pub fn ceiling(&self, failures: u32) -> Duration {
        Duration::from_millis(self.ceiling_ms(failures))
    }

    fn ceiling_ms(&self, failures: u32) -> u64 {
        if failures == 0 {
            return self.base_ms / 2;
        }
        let exponent = (failures - 1).min(MAX_EXPONENT);
        self.base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.cap_ms)
    }

    /// Delay for the given failure count and a jitter sample in `[0, 1]`.
    pub fn delay_with_sample(&self, failures: u32, sample: f64) -> Duration {
        let failures = failures.max(1);
        let low = self.ceiling_ms(failures - 1);
        let high = self.ceiling_ms(failures);
        let sample = if sample.is_finite() {
            sample.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let span = high.saturating_sub(low) as f64;
        let ms = low + (span * sample).round() as u64;
        Duration::from_millis(ms.min(high))
    }

    /// Jittered delay for the given failure count.
    pub fn delay(&self, failures: u32) -> Duration {
        let sample = rand::thread_rng().gen_range(0.0..=1.0);
        self.delay_with_sample(failures, sample)
    }
}

/// Consecutive-failure bookkeeping for one connection.
#[derive(Clone, Debug)]
pub struct BackoffState {
    policy: Backoff,
    consecutive_failures: u32,
}

impl BackoffState {
    pub fn new(policy: Backoff) -> Self {
        Self {
            policy,
            consecutive_failures: 0,
        }
    }

    /// Records a failure and returns how long to wait before retrying.
    pub fn on_failure(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.policy.delay(self.consecutive_failures)
    }

    /// Clears the failure streak after a successful open. Returns the streak.
    pub fn on_success(&mut self) -> u32 {
        std::mem::take(&mut self.consecutive_failures)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
