//! Order-rate limiting
//!
//! Sliding-window limiter for order submissions plus the liquidity-scaled
//! wait used when cancelling stale unfilled orders.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Width of the trailing submission window
const WINDOW: Duration = Duration::from_secs(60);

/// Guards against division by a zero 24h volume
const VOLUME_EPSILON: f64 = 1e-9;

/// Sliding-window order-rate limiter
#[derive(Debug, Clone)]
pub struct RateGovernor {
    order_cooldown: Duration,
    max_orders_per_minute: usize,
    cancel_base_wait: f64,
    cancel_min_wait: f64,
    cancel_max_wait: f64,
    cancel_volume_scale: f64,
    window: VecDeque<Instant>,
    last_order_at: Option<Instant>,
}

impl RateGovernor {
    pub fn new(band: &crate::config::StrategyBand) -> Self {
        Self {
            order_cooldown: Duration::from_secs_f64(band.order_cooldown),
            max_orders_per_minute: band.max_orders_per_minute,
            cancel_base_wait: band.cancel_base_wait,
            cancel_min_wait: band.cancel_min_wait,
            cancel_max_wait: band.cancel_max_wait,
            cancel_volume_scale: band.cancel_volume_scale,
            window: VecDeque::new(),
            last_order_at: None,
        }
    }

    /// True when a new submission is allowed right now
    pub fn may_submit(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_order_at {
            if now.saturating_duration_since(last) < self.order_cooldown {
                return false;
            }
        }
        self.prune(now);
        self.window.len() < self.max_orders_per_minute
    }

    /// Record one attempted submission. Call exactly once per attempt,
    /// regardless of whether the venue accepted the order.
    pub fn record(&mut self, now: Instant) {
        self.window.push_back(now);
        self.last_order_at = Some(now);
    }

    /// How long an unfilled order may rest before cancellation. Thinner
    /// liquidity (lower 24h volume) yields a longer wait.
    pub fn stale_wait(&self, volume_24h: f64) -> Duration {
        let secs = (self.cancel_base_wait * self.cancel_volume_scale
            / volume_24h.max(VOLUME_EPSILON))
        .clamp(self.cancel_min_wait, self.cancel_max_wait);
        Duration::from_secs_f64(secs)
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.window.front() {
            if now.saturating_duration_since(front) > WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyBand;

    fn governor(cooldown: f64, max_per_min: usize) -> RateGovernor {
        RateGovernor::new(&StrategyBand {
            order_cooldown: cooldown,
            max_orders_per_minute: max_per_min,
            cancel_base_wait: 10.0,
            cancel_min_wait: 5.0,
            cancel_max_wait: 30.0,
            cancel_volume_scale: 2000.0,
            ..StrategyBand::default()
        })
    }

    #[test]
    fn test_cooldown_blocks_submission() {
        let mut gov = governor(6.0, 10);
        let t0 = Instant::now();
        assert!(gov.may_submit(t0));
        gov.record(t0);
        assert!(!gov.may_submit(t0 + Duration::from_secs(5)));
        assert!(gov.may_submit(t0 + Duration::from_secs(6)));
    }

    #[test]
    fn test_window_blocks_when_full() {
        let mut gov = governor(0.0, 3);
        let t0 = Instant::now();
        for i in 0..3 {
            let t = t0 + Duration::from_secs(i);
            assert!(gov.may_submit(t));
            gov.record(t);
        }
        assert!(!gov.may_submit(t0 + Duration::from_secs(10)));
        // oldest entry expires out of the trailing 60s
        assert!(gov.may_submit(t0 + Duration::from_secs(61)));
    }

    #[test]
    fn test_prune_is_idempotent() {
        let mut gov = governor(0.0, 5);
        let t0 = Instant::now();
        gov.record(t0);
        gov.record(t0 + Duration::from_secs(1));
        let later = t0 + Duration::from_secs(120);
        gov.prune(later);
        let after_first = gov.window.len();
        gov.prune(later);
        assert_eq!(gov.window.len(), after_first);
        assert_eq!(after_first, 0);
    }

    #[test]
    fn test_stale_wait_non_increasing_in_volume() {
        let gov = governor(6.0, 6);
        let thin = gov.stale_wait(100.0);
        let mid = gov.stale_wait(2000.0);
        let thick = gov.stale_wait(100_000.0);
        assert!(thin >= mid);
        assert!(mid >= thick);
        // clamped at both ends
        assert_eq!(gov.stale_wait(0.0), Duration::from_secs_f64(30.0));
        assert_eq!(gov.stale_wait(1e12), Duration::from_secs_f64(5.0));
    }
}
