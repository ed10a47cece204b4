//! Exponential backoff with jitter for part and range retries.

use rand::{Rng, SeedableRng, rngs::StdRng};
use std::time::Duration;

use crate::constants::MAX_RETRY_ATTEMPTS;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total tries per chunk, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor between consecutive retries.
    pub factor: u32,
    /// Upper bound of the random extra delay, as a fraction of the base.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRY_ATTEMPTS,
            base_delay: Duration::from_secs(1),
            factor: 4,
            jitter_ratio: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Policy that retries immediately; used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            factor: 1,
            jitter_ratio: 0.0,
        }
    }

    /// Whether a try numbered `attempt` (0-based) is still allowed.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Delay before try number `attempt` (0-based).
///
/// The first try goes out immediately. Try `n` waits
/// `base * factor^(n-1)` plus `jitter_fraction * jitter_ratio` of that base,
/// where `jitter_fraction` is expected in `[0, 1)`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32, jitter_fraction: f64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let exp = policy.factor.saturating_pow(attempt - 1);
    let base = policy.base_delay.saturating_mul(exp);
    let jitter = base.mul_f64((jitter_fraction.clamp(0.0, 1.0)) * policy.jitter_ratio);
    base.saturating_add(jitter)
}

/// Backoff sequence drawing jitter from an owned random source.
pub struct Backoff {
    policy: RetryPolicy,
    rng: StdRng,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic jitter for reproducible runs.
    pub fn with_seed(policy: RetryPolicy, seed: u64) -> Self {
        Self {
            policy,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn delay(&mut self, attempt: u32) -> Duration {
        let fraction: f64 = self.rng.r#gen();
        backoff_delay(&self.policy, attempt, fraction)
    }
}
