//! Timing policy for detection attempts
//!
//! A strategy is a pure function of the retry counters. It never reads a
//! clock, so every delay it produces can be checked in isolation.

use crate::error::{DetectorError, Result};
use crate::models::{ProbeOutcome, RetryCounters};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyId {
    /// Exponential backoff on repeated results, light polling once online
    Backoff,
    /// Constant delay between attempts
    FixedInterval,
}

impl FromStr for StrategyId {
    type Err = DetectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "backoff" => Ok(StrategyId::Backoff),
            "fixed_interval" | "fixed-interval" | "fixed" => Ok(StrategyId::FixedInterval),
            _ => Err(DetectorError::InvalidStrategy(s.to_string())),
        }
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyId::Backoff => f.write_str("backoff"),
            StrategyId::FixedInterval => f.write_str("fixed_interval"),
        }
    }
}

/// Delay constants shared by all strategies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyTimings {
    /// Delay before the first attempt after detection starts
    pub startup_delay: Duration,
    /// First step of the backoff schedule
    pub base_delay: Duration,
    /// Upper bound for any backoff delay
    pub max_backoff: Duration,
    /// Largest power of two applied to `base_delay`
    pub backoff_cap_exponent: u32,
    /// Re-check interval for a network already known to be online
    pub poll_interval: Duration,
    /// Interval used by [`StrategyId::FixedInterval`]
    pub fixed_interval: Duration,
}

impl Default for StrategyTimings {
    fn default() -> Self {
        Self {
            startup_delay: Duration::ZERO,
            base_delay: Duration::from_secs(3),
            max_backoff: Duration::from_secs(300),
            backoff_cap_exponent: 6,
            poll_interval: Duration::from_secs(30),
            fixed_interval: Duration::from_secs(15),
        }
    }
}

impl StrategyTimings {
    pub fn validate(&self) -> Result<()> {
        if self.base_delay.is_zero() {
            return Err(DetectorError::InvalidTimings(
                "base_delay must be greater than zero".into(),
            ));
        }
        if self.max_backoff < self.base_delay {
            return Err(DetectorError::InvalidTimings(format!(
                "max_backoff ({:?}) is shorter than base_delay ({:?})",
                self.max_backoff, self.base_delay
            )));
        }
        if self.poll_interval.is_zero() || self.fixed_interval.is_zero() {
            return Err(DetectorError::InvalidTimings(
                "poll_interval and fixed_interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionStrategy {
    id: StrategyId,
    timings: StrategyTimings,
}

impl DetectionStrategy {
    pub fn new(id: StrategyId, timings: StrategyTimings) -> Self {
        Self { id, timings }
    }

    pub fn id(&self) -> StrategyId {
        self.id
    }

    pub fn timings(&self) -> &StrategyTimings {
        &self.timings
    }

    /// Delay before the next attempt given the current streaks
    pub fn next_attempt_delay(&self, counters: &RetryCounters, is_first_attempt: bool) -> Duration {
        if is_first_attempt {
            return self.timings.startup_delay;
        }

        match self.id {
            StrategyId::Backoff => match counters.last_outcome {
                Some(ProbeOutcome::Online) => self.timings.poll_interval,
                _ => self.backoff_delay(counters.same_result_count),
            },
            StrategyId::FixedInterval => match counters.last_outcome {
                Some(ProbeOutcome::Portal | ProbeOutcome::ProxyAuthRequired) => self
                    .timings
                    .fixed_interval
                    .max(self.backoff_delay(counters.same_result_count)),
                _ => self.timings.fixed_interval,
            },
        }
    }

    /// `base * 2^min(count - 1, cap)`, clamped to `max_backoff`
    pub fn backoff_delay(&self, same_result_count: u32) -> Duration {
        let exponent = same_result_count
            .saturating_sub(1)
            .min(self.timings.backoff_cap_exponent);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);

        self.timings
            .base_delay
            .saturating_mul(factor)
            .min(self.timings.max_backoff)
    }
}
