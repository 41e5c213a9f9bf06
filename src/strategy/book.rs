//! Position ledger
//!
//! Owns the open positions and the base price the grid hangs from. Buy
//! triggers descend from the base price; the base price itself only moves
//! down (toward the quantity-weighted average entry) while positions are
//! open, and is only re-anchored upward by an explicit stale reset.

use chrono::{DateTime, Duration, Utc};

use crate::config::StrategyBand;

/// A single open position
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub id: u64,
    pub entry_price: f64,
    pub quantity: f64,
    pub opened_at: DateTime<Utc>,
}

/// Why a position was flagged for exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "TP",
            ExitReason::StopLoss => "SL",
        }
    }
}

/// A position flagged for exit in the current cycle
#[derive(Debug, Clone)]
pub struct ExitCandidate {
    pub id: u64,
    pub entry_price: f64,
    pub quantity: f64,
    pub reason: ExitReason,
}

/// Ledger of open positions plus the grid base price
#[derive(Debug, Clone)]
pub struct PositionBook {
    positions: Vec<Position>,
    base_price: f64,
    last_fill_at: DateTime<Utc>,
    next_id: u64,
    buy_step: f64,
    martingale_multiplier: f64,
    max_steps: usize,
    base_order_value: f64,
}

impl PositionBook {
    /// Create an empty book anchored at the given market price
    pub fn new(base_price: f64, band: &StrategyBand, now: DateTime<Utc>) -> Self {
        Self {
            positions: Vec::new(),
            base_price,
            last_fill_at: now,
            next_id: 0,
            buy_step: band.buy_step,
            martingale_multiplier: band.martingale_multiplier,
            max_steps: band.max_steps,
            base_order_value: band.base_order_value,
        }
    }

    pub fn base_price(&self) -> f64 {
        self.base_price
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn total_quantity(&self) -> f64 {
        self.positions.iter().map(|p| p.quantity).sum()
    }

    /// Quantity-weighted average entry price, 0 when empty
    pub fn avg_entry_price(&self) -> f64 {
        let total = self.total_quantity();
        if total <= 0.0 {
            return 0.0;
        }
        self.positions
            .iter()
            .map(|p| p.entry_price * p.quantity)
            .sum::<f64>()
            / total
    }

    /// Index of the next grid step, equal to the open position count
    pub fn next_step(&self) -> usize {
        self.positions.len()
    }

    /// True once the grid is fully deployed; no further buys are evaluated
    pub fn is_full(&self) -> bool {
        self.positions.len() >= self.max_steps
    }

    /// Price at which grid step `step_index` buys, strictly decreasing
    pub fn next_buy_trigger(&self, step_index: usize) -> f64 {
        self.base_price * (1.0 - self.buy_step * (step_index as f64 + 1.0))
    }

    /// Order value for grid step `step_index`, strictly increasing for a
    /// martingale multiplier above one
    pub fn next_order_value(&self, step_index: usize) -> f64 {
        self.base_order_value * self.martingale_multiplier.powi(step_index as i32)
    }

    /// Record a confirmed buy fill; the base price follows the weighted
    /// average entry downward and never rises here
    pub fn register_fill(&mut self, price: f64, qty: f64, now: DateTime<Utc>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.positions.push(Position {
            id,
            entry_price: price,
            quantity: qty,
            opened_at: now,
        });
        self.last_fill_at = now;
        self.base_price = self.base_price.min(self.avg_entry_price());
        id
    }

    /// Flag positions whose change vs. entry crosses TP or SL. Candidates
    /// are returned in ascending entry-price order for determinism.
    pub fn evaluate_exits(&self, price: f64, tp: f64, sl: f64) -> Vec<ExitCandidate> {
        // Positive thresholds make simultaneous TP and SL impossible for a
        // single position; a non-positive threshold would be a config bug.
        debug_assert!(tp > 0.0 && sl > 0.0);

        let mut out: Vec<ExitCandidate> = self
            .positions
            .iter()
            .filter_map(|p| {
                if p.entry_price <= 0.0 {
                    return None;
                }
                let change = (price - p.entry_price) / p.entry_price;
                let reason = if change >= tp {
                    ExitReason::TakeProfit
                } else if change <= -sl {
                    ExitReason::StopLoss
                } else {
                    return None;
                };
                Some(ExitCandidate {
                    id: p.id,
                    entry_price: p.entry_price,
                    quantity: p.quantity,
                    reason,
                })
            })
            .collect();
        out.sort_by(|a, b| a.entry_price.total_cmp(&b.entry_price));
        out
    }

    /// Remove a position on a confirmed sell fill and return the realized
    /// PnL. The base price is clamped to the recomputed average so the
    /// non-increasing invariant holds; realized PnL is not stored here.
    pub fn remove(&mut self, id: u64, sell_price: f64, now: DateTime<Utc>) -> Option<f64> {
        let idx = self.positions.iter().position(|p| p.id == id)?;
        let position = self.positions.remove(idx);
        self.last_fill_at = now;
        if !self.positions.is_empty() {
            self.base_price = self.base_price.min(self.avg_entry_price());
        }
        Some(position.quantity * (sell_price - position.entry_price))
    }

    /// Re-anchor the base price to the market when the book has been empty
    /// with no fill for `base_reset_minutes`. Returns true when the reset
    /// fired.
    pub fn reset_if_stale(
        &mut self,
        price: f64,
        now: DateTime<Utc>,
        base_reset_minutes: f64,
    ) -> bool {
        if !self.positions.is_empty() || price <= 0.0 {
            return false;
        }
        let window = Duration::seconds((base_reset_minutes * 60.0) as i64);
        if now - self.last_fill_at < window {
            return false;
        }
        self.base_price = price;
        self.last_fill_at = now;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn band() -> StrategyBand {
        StrategyBand {
            buy_step: 0.005,
            martingale_multiplier: 1.3,
            max_steps: 10,
            base_order_value: 5000.0,
            ..StrategyBand::default()
        }
    }

    #[test]
    fn test_buy_triggers_descend_from_base() {
        let book = PositionBook::new(1500.0, &band(), Utc::now());
        assert!((book.next_buy_trigger(0) - 1492.5).abs() < 1e-9);
        assert!((book.next_buy_trigger(1) - 1485.0).abs() < 1e-9);
        assert!((book.next_buy_trigger(2) - 1477.5).abs() < 1e-9);
        for i in 0..9 {
            assert!(book.next_buy_trigger(i + 1) < book.next_buy_trigger(i));
        }
    }

    #[test]
    fn test_order_values_grow_with_martingale() {
        let book = PositionBook::new(1500.0, &band(), Utc::now());
        assert!((book.next_order_value(0) - 5000.0).abs() < 1e-9);
        assert!((book.next_order_value(1) - 6500.0).abs() < 1e-9);
        assert!((book.next_order_value(2) - 8450.0).abs() < 1e-6);
        for i in 0..9 {
            assert!(book.next_order_value(i + 1) > book.next_order_value(i));
        }
    }

    #[test]
    fn test_base_price_non_increasing_under_fills() {
        let mut book = PositionBook::new(1500.0, &band(), Utc::now());
        let mut last_base = book.base_price();
        for price in [1490.0, 1480.0, 1495.0, 1470.0] {
            book.register_fill(price, 1.0, Utc::now());
            assert!(book.base_price() <= last_base);
            assert!(book.base_price() <= book.avg_entry_price() + 1e-9);
            last_base = book.base_price();
        }
    }

    #[test]
    fn test_remove_reports_pnl_and_keeps_invariant() {
        let mut book = PositionBook::new(1500.0, &band(), Utc::now());
        let id_a = book.register_fill(1490.0, 2.0, Utc::now());
        let _id_b = book.register_fill(1480.0, 1.0, Utc::now());
        let base_before = book.base_price();

        let pnl = book.remove(id_a, 1500.0, Utc::now()).unwrap();
        assert!((pnl - 20.0).abs() < 1e-9);
        assert_eq!(book.len(), 1);
        assert!(book.base_price() <= base_before);

        assert!(book.remove(999, 1500.0, Utc::now()).is_none());
    }

    #[test]
    fn test_evaluate_exits_orders_by_entry_price() {
        let mut book = PositionBook::new(1500.0, &band(), Utc::now());
        book.register_fill(1490.0, 1.0, Utc::now());
        book.register_fill(1470.0, 1.0, Utc::now());
        book.register_fill(1480.0, 1.0, Utc::now());

        let exits = book.evaluate_exits(1500.0, 0.001, 0.05);
        assert_eq!(exits.len(), 3);
        assert!(exits[0].entry_price <= exits[1].entry_price);
        assert!(exits[1].entry_price <= exits[2].entry_price);
        assert!(exits.iter().all(|e| e.reason == ExitReason::TakeProfit));
    }

    #[test]
    fn test_tp_from_floor_and_volatility() {
        // entry 1000, tp = max(0.003, 0.0033) = 0.0033 => exit at >= 1003.3
        let mut book = PositionBook::new(1000.0, &band(), Utc::now());
        book.register_fill(1000.0, 1.0, Utc::now());
        let tp = f64::max(0.003, 0.006 * 0.55);
        assert!((tp - 0.0033).abs() < 1e-12);

        assert!(book.evaluate_exits(1003.2, tp, 0.01).is_empty());
        let exits = book.evaluate_exits(1003.3, tp, 0.01);
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].reason, ExitReason::TakeProfit);
    }

    #[test]
    fn test_stop_loss_flags_negative_change() {
        let mut book = PositionBook::new(1000.0, &band(), Utc::now());
        book.register_fill(1000.0, 1.0, Utc::now());
        let exits = book.evaluate_exits(990.0, 0.003, 0.008);
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].reason, ExitReason::StopLoss);
    }

    #[test]
    fn test_stale_reset_only_when_empty_and_old() {
        let start = Utc::now();
        let mut book = PositionBook::new(1500.0, &band(), start);

        // within the window: no reset
        assert!(!book.reset_if_stale(1400.0, start + Duration::minutes(10), 30.0));
        assert_eq!(book.base_price(), 1500.0);

        // past the window: re-anchor to the market
        assert!(book.reset_if_stale(1400.0, start + Duration::minutes(31), 30.0));
        assert_eq!(book.base_price(), 1400.0);

        // never while positions exist
        book.register_fill(1390.0, 1.0, start + Duration::minutes(31));
        assert!(!book.reset_if_stale(1300.0, start + Duration::minutes(120), 30.0));
    }

    #[test]
    fn test_grid_capped_at_max_steps() {
        let mut book = PositionBook::new(1500.0, &band(), Utc::now());
        for _ in 0..10 {
            book.register_fill(1490.0, 1.0, Utc::now());
        }
        assert!(book.is_full());
    }
}
