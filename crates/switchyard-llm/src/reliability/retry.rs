use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use switchyard_core::{ErrorKind, FieldError, GatewayError};

/// Retry behaviour of a [`super::ReliableProvider`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Cap on any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor per attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Each delay is scaled by a random factor in `1 ± jitter`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Kinds worth another attempt.
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<ErrorKind>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

fn default_retry_on() -> Vec<ErrorKind> {
    vec![
        ErrorKind::RateLimit,
        ErrorKind::Server,
        ErrorKind::Timeout,
        ErrorKind::Stream,
        ErrorKind::Provider,
    ]
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            retry_on: default_retry_on(),
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Whether `err` earns another attempt.
    ///
    /// Validation, Authentication, QuotaExceeded, Config and CircuitOpen are
    /// never retried, whatever `retry_on` says; Stream errors only when
    /// resumable.
    pub fn should_retry(&self, err: &GatewayError) -> bool {
        err.is_retryable() && self.retry_on.contains(&err.kind())
    }

    /// Exponential delay before retry number `attempt + 1`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if self.initial_delay_ms == 0 {
            return Duration::ZERO;
        }
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let ms = self.initial_delay_ms as f64 * self.multiplier.powi(exp);
        let capped = ms.min(self.max_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Delay before retry number `attempt + 1`.
    ///
    /// A backend `retry-after` replaces the computed delay, clamped to
    /// `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32, err: &GatewayError) -> Duration {
        if let Some(after) = err.retry_after() {
            return after.min(Duration::from_millis(self.max_delay_ms));
        }
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        base.mul_f64(factor.max(0.0))
    }

    /// Field errors, prefixed with `prefix`.
    pub fn validate(&self, prefix: &str) -> Vec<FieldError> {
        let mut errors = Vec::new();
        if self.max_delay_ms < self.initial_delay_ms {
            errors.push(FieldError::new(
                format!("{prefix}.max_delay_ms"),
                "must be at least initial_delay_ms",
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            errors.push(FieldError::new(
                format!("{prefix}.multiplier"),
                "must be a finite number >= 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            errors.push(FieldError::new(
                format!("{prefix}.jitter"),
                "must be between 0.0 and 1.0",
            ));
        }
        for kind in &self.retry_on {
            if !kind.default_retryable() {
                errors.push(FieldError::new(
                    format!("{prefix}.retry_on"),
                    format!("{kind} errors are never retried"),
                ));
            }
        }
        errors
    }
}
