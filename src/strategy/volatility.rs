//! EWMA volatility estimation
//!
//! Maintains an exponentially weighted variance of log returns and exposes
//! the square root clamped into `[vol_min, vol_max]`. The smoothing factor
//! follows the configured half-life: `alpha = 1 - 0.5^(dt / halflife)`, so a
//! single price shock decays back toward the floor within roughly one
//! half-life of quiet samples.

use std::time::Instant;

/// Single samples are clamped to this absolute log return before entering
/// the variance; one bad tick must not poison the estimate.
const MAX_ABS_RETURN: f64 = 0.2;

/// EWMA-based volatility estimator
#[derive(Debug, Clone)]
pub struct VolatilityEstimator {
    halflife_secs: f64,
    vol_min: f64,
    vol_max: f64,
    variance: f64,
    prev_price: Option<f64>,
    last_update_at: Option<Instant>,
}

impl VolatilityEstimator {
    pub fn new(halflife_secs: f64, vol_min: f64, vol_max: f64) -> Self {
        Self {
            halflife_secs: halflife_secs.max(1e-9),
            vol_min,
            vol_max,
            // Seed at the floor so the estimate is well-defined before the
            // first return sample exists.
            variance: vol_min.max(1e-6) * vol_min.max(1e-6),
            prev_price: None,
            last_update_at: None,
        }
    }

    /// Feed one price observation and return the updated volatility
    pub fn consume(&mut self, price: f64, now: Instant) -> f64 {
        if price <= 0.0 {
            return self.volatility();
        }

        let (Some(prev), Some(last_at)) = (self.prev_price, self.last_update_at) else {
            self.prev_price = Some(price);
            self.last_update_at = Some(now);
            return self.volatility();
        };

        let dt = now.saturating_duration_since(last_at).as_secs_f64();
        self.prev_price = Some(price);
        self.last_update_at = Some(now);

        let r = (price / prev).ln().clamp(-MAX_ABS_RETURN, MAX_ABS_RETURN);
        let alpha = 1.0 - 0.5_f64.powf(dt / self.halflife_secs);
        self.variance = alpha * (r * r) + (1.0 - alpha) * self.variance;

        self.volatility()
    }

    /// Current volatility estimate, clamped into `[vol_min, vol_max]`
    pub fn volatility(&self) -> f64 {
        self.variance.max(0.0).sqrt().clamp(self.vol_min, self.vol_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn feed(est: &mut VolatilityEstimator, prices: &[f64], step: Duration) -> f64 {
        let mut now = Instant::now();
        let mut vol = est.volatility();
        for &p in prices {
            vol = est.consume(p, now);
            now += step;
        }
        vol
    }

    #[test]
    fn test_floor_before_first_sample() {
        let est = VolatilityEstimator::new(30.0, 0.004, 0.015);
        assert_eq!(est.volatility(), 0.004);
    }

    #[test]
    fn test_constant_stream_converges_to_floor() {
        let mut est = VolatilityEstimator::new(30.0, 0.004, 0.015);
        let prices = vec![1500.0; 200];
        let vol = feed(&mut est, &prices, Duration::from_secs(2));
        assert_eq!(vol, 0.004);
    }

    #[test]
    fn test_shock_decays_within_halflife_scale() {
        let halflife = 30.0;
        let mut est = VolatilityEstimator::new(halflife, 0.001, 0.5);
        let mut now = Instant::now();
        let step = Duration::from_secs(2);

        est.consume(1500.0, now);
        now += step;
        // 10% shock
        let shocked = est.consume(1650.0, now);
        assert!(shocked > 0.01);

        // Quiet samples spanning several half-lives must pull the estimate
        // back near the floor.
        let mut vol = shocked;
        for _ in 0..300 {
            now += step;
            vol = est.consume(1650.0, now);
        }
        assert!(vol < shocked / 4.0);
    }

    #[test]
    fn test_never_exceeds_ceiling() {
        let mut est = VolatilityEstimator::new(10.0, 0.001, 0.015);
        let mut now = Instant::now();
        let mut price = 1000.0;
        for i in 0..100 {
            // violent alternating moves
            price *= if i % 2 == 0 { 1.2 } else { 0.8 };
            let vol = est.consume(price, now);
            assert!(vol <= 0.015);
            assert!(vol >= 0.001);
            now += Duration::from_secs(1);
        }
    }

    #[test]
    fn test_non_positive_price_ignored() {
        let mut est = VolatilityEstimator::new(30.0, 0.004, 0.015);
        let now = Instant::now();
        est.consume(1500.0, now);
        let before = est.volatility();
        let after = est.consume(0.0, now + Duration::from_secs(2));
        assert_eq!(before, after);
    }
}
