//! Per-category failure backoff
//!
//! One instance per operation category (buy, sell). Repeated failures grow
//! the pause geometrically up to a cap; a single success resets it. A sell
//! failure never blocks buys and vice versa.

use std::time::{Duration, Instant};

/// Operation category the backoff applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCategory {
    Buy,
    Sell,
}

impl OpCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpCategory::Buy => "buy",
            OpCategory::Sell => "sell",
        }
    }
}

/// Exponential pause on consecutive failures
#[derive(Debug, Clone)]
pub struct FailureBackoff {
    base_pause_secs: f64,
    factor: f64,
    max_pause_secs: f64,
    consecutive_failures: u32,
    paused_until: Option<Instant>,
}

impl FailureBackoff {
    pub fn new(base_pause_secs: f64, factor: f64, max_pause_secs: f64) -> Self {
        Self {
            base_pause_secs,
            factor,
            max_pause_secs,
            consecutive_failures: 0,
            paused_until: None,
        }
    }

    pub fn from_band(band: &crate::config::StrategyBand) -> Self {
        Self::new(
            band.failure_pause_seconds,
            band.failure_pause_backoff,
            band.failure_pause_max,
        )
    }

    /// Register a failure and return the pause that now applies
    pub fn on_failure(&mut self, now: Instant) -> Duration {
        self.consecutive_failures += 1;
        let exponent = (self.consecutive_failures - 1) as i32;
        let pause_secs =
            (self.base_pause_secs * self.factor.powi(exponent)).min(self.max_pause_secs);
        let pause = Duration::from_secs_f64(pause_secs);
        self.paused_until = Some(now + pause);
        pause
    }

    /// A success clears the failure streak and any pending pause
    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.paused_until = None;
    }

    pub fn is_blocked(&self, now: Instant) -> bool {
        match self.paused_until {
            Some(until) => now < until,
            None => false,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence_capped() {
        let mut backoff = FailureBackoff::new(10.0, 2.0, 180.0);
        let now = Instant::now();
        let expected = [10.0, 20.0, 40.0, 80.0, 160.0, 180.0, 180.0];
        for want in expected {
            let pause = backoff.on_failure(now);
            assert!((pause.as_secs_f64() - want).abs() < 1e-9);
        }
    }

    #[test]
    fn test_success_resets() {
        let mut backoff = FailureBackoff::new(10.0, 2.0, 180.0);
        let now = Instant::now();
        backoff.on_failure(now);
        backoff.on_failure(now);
        backoff.on_success();
        assert!(!backoff.is_blocked(now));
        let pause = backoff.on_failure(now);
        assert!((pause.as_secs_f64() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_blocked_until_pause_expires() {
        let mut backoff = FailureBackoff::new(10.0, 2.0, 180.0);
        let now = Instant::now();
        backoff.on_failure(now);
        assert!(backoff.is_blocked(now + Duration::from_secs(9)));
        assert!(!backoff.is_blocked(now + Duration::from_secs(10)));
    }

    #[test]
    fn test_categories_are_independent_instances() {
        let now = Instant::now();
        let mut sell = FailureBackoff::new(10.0, 2.0, 180.0);
        let buy = FailureBackoff::new(10.0, 2.0, 180.0);
        sell.on_failure(now);
        assert!(sell.is_blocked(now));
        assert!(!buy.is_blocked(now));
    }
}
