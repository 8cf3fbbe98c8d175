use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::deadline::Deadline;

/// Delays below this are reported as exhausted rather than slept on.
const MIN_DELAY_SECS: f64 = 0.001;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackoffError {
    #[error("initial delay must be greater than zero")]
    ZeroInitialDelay,
    #[error("multiplier must be a finite value >= 1.0, got {0}")]
    InvalidMultiplier(f64),
    #[error("invalid jitter `{0}` (expected none, full or additive:<ms>)")]
    InvalidJitter(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    None,
    /// Uniform in `[0, raw]`.
    Full,
    /// `raw` plus uniform in `[0, x]`.
    Additive(Duration),
}

impl FromStr for Jitter {
    type Err = BackoffError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "" | "none" => return Ok(Jitter::None),
            "full" => return Ok(Jitter::Full),
            _ => {}
        }
        trimmed
            .strip_prefix("additive:")
            .and_then(|ms| ms.trim().parse::<u64>().ok())
            .map(|ms| Jitter::Additive(Duration::from_millis(ms)))
            .ok_or_else(|| BackoffError::InvalidJitter(value.to_string()))
    }
}

impl fmt::Display for Jitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Jitter::None => f.write_str("none"),
            Jitter::Full => f.write_str("full"),
            Jitter::Additive(extra) => write!(f, "additive:{}", extra.as_millis()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_total_duration: Duration,
    pub jitter: Jitter,
}

/// A validated [`BackoffConfig`]. Every calculator started from it shares
/// the same parameters but tracks its own attempt count and deadline.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    config: BackoffConfig,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Result<Self, BackoffError> {
        if config.initial_delay.is_zero() {
            return Err(BackoffError::ZeroInitialDelay);
        }
        if !config.multiplier.is_finite() || config.multiplier < 1.0 {
            return Err(BackoffError::InvalidMultiplier(config.multiplier));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Same parameters with a different overall budget.
    pub fn with_max_total_duration(&self, max_total_duration: Duration) -> Self {
        let mut config = self.config.clone();
        config.max_total_duration = max_total_duration;
        Self { config }
    }

    pub fn start(&self) -> Backoff {
        self.start_with_rng(StdRng::from_entropy())
    }

    pub fn start_with_rng(&self, rng: impl RngCore + Send + 'static) -> Backoff {
        Backoff {
            config: self.config.clone(),
            attempt: 0,
            deadline: Deadline::new(self.config.max_total_duration),
            rng: Box::new(rng),
        }
    }
}

/// Successive retry delays with jitter, hard-stopped by a deadline.
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    deadline: Deadline,
    rng: Box<dyn RngCore + Send>,
}

impl Backoff {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    pub fn deadline_mut(&mut self) -> &mut Deadline {
        &mut self.deadline
    }

    /// Next delay to sleep, or `None` once the budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        let remaining = self.deadline.remaining();
        if remaining.is_zero() {
            return None;
        }

        let initial = self.config.initial_delay.as_secs_f64();
        let max = self.config.max_delay.as_secs_f64();
        let exponent = i32::try_from(self.attempt - 1).unwrap_or(i32::MAX);
        let raw = initial * self.config.multiplier.powi(exponent);
        let raw = if raw.is_finite() { raw.min(max) } else { max };

        let jittered = match self.config.jitter {
            Jitter::None => raw,
            Jitter::Full => self.rng.gen_range(0.0..=raw),
            Jitter::Additive(extra) => raw + self.rng.gen_range(0.0..=extra.as_secs_f64()),
        };

        let delay = jittered
            .max(initial / 2.0)
            .min(max)
            .min(remaining.as_secs_f64());
        if delay < MIN_DELAY_SECS {
            return None;
        }
        Some(Duration::from_secs_f64(delay))
    }
}
