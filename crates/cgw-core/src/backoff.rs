//! Reconnect backoff: capped exponential growth with upward jitter.
//!
//! Jitter only ever stretches a delay (`base * (1 + r)`, `r` in `[0, jitter]`).
//! With `jitter <= multiplier - 1` consecutive delays never shrink until the cap
//! is reached.

use std::time::Duration;

use rand::Rng;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub min: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl BackoffPolicy {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.min.is_zero() {
            return Err("reconnect minimum delay must be positive".to_string());
        }
        if self.max < self.min {
            return Err("reconnect maximum delay must be >= the minimum".to_string());
        }
        if !(self.multiplier >= 1.0) || !self.multiplier.is_finite() {
            return Err("reconnect multiplier must be >= 1".to_string());
        }
        if !(0.0..=self.multiplier - 1.0).contains(&self.jitter) {
            return Err(format!(
                "reconnect jitter must be within [0, multiplier - 1] = [0, {}]",
                self.multiplier - 1.0
            ));
        }
        Ok(())
    }
}

/// Per-tenant backoff state.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    base: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            base: policy.min,
        }
    }

    /// Delay before the next attempt; advances the exponential base.
    pub fn next_delay(&mut self) -> Duration {
        let factor = if self.policy.jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(0.0..=self.policy.jitter)
        } else {
            1.0
        };
        let delay = scale_capped(self.base, factor, self.policy.max);
        self.base = scale_capped(self.base, self.policy.multiplier, self.policy.max);
        delay
    }

    /// Back to the minimum after a successful (re)connect.
    pub fn reset(&mut self) {
        self.base = self.policy.min;
    }

    pub fn current_base(&self) -> Duration {
        self.base
    }
}

/// `d * factor`, saturating at `cap` instead of overflowing `Duration`.
fn scale_capped(d: Duration, factor: f64, cap: Duration) -> Duration {
    Duration::try_from_secs_f64(d.as_secs_f64() * factor).map_or(cap, |scaled| scaled.min(cap))
}
