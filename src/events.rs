//! Structured events emitted by the engine
//!
//! The engine reports every position mutation as a [`TradeEvent`] and a
//! periodic [`EngineSnapshot`]. External consumers (log shippers, dashboards)
//! attach through the [`EventSink`] trait; the default sink writes both
//! shapes through `tracing`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Kind of a trade event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Buy,
    Sell,
    Error,
}

/// Emitted once per position mutation (or failed attempt)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub price: f64,
    pub qty: f64,
    pub position_count: usize,
    pub realized_pnl_delta: f64,
    pub note: String,
}

impl TradeEvent {
    pub fn new(kind: EventKind, price: f64, qty: f64, position_count: usize) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            price,
            qty,
            position_count,
            realized_pnl_delta: 0.0,
            note: String::new(),
        }
    }

    pub fn with_pnl(mut self, pnl: f64) -> Self {
        self.realized_pnl_delta = pnl;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }
}

/// Periodic state snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub price: f64,
    pub positions: usize,
    pub avg_price: f64,
    pub today_realized_pnl: f64,
    pub volatility: f64,
    pub last_error: Option<String>,
}

/// Destination for engine events
pub trait EventSink: Send {
    fn trade(&mut self, event: &TradeEvent);
    fn snapshot(&mut self, snapshot: &EngineSnapshot);
}

/// Default sink that emits events as structured tracing records
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn trade(&mut self, event: &TradeEvent) {
        match event.kind {
            EventKind::Error => error!(
                price = event.price,
                qty = event.qty,
                positions = event.position_count,
                note = %event.note,
                "trade error"
            ),
            EventKind::Buy | EventKind::Sell => info!(
                kind = ?event.kind,
                price = event.price,
                qty = event.qty,
                positions = event.position_count,
                pnl = event.realized_pnl_delta,
                note = %event.note,
                "fill"
            ),
        }
    }

    fn snapshot(&mut self, snapshot: &EngineSnapshot) {
        info!(
            price = snapshot.price,
            positions = snapshot.positions,
            avg_price = snapshot.avg_price,
            today_pnl = snapshot.today_realized_pnl,
            volatility = snapshot.volatility,
            last_error = snapshot.last_error.as_deref().unwrap_or(""),
            "snapshot"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_serialization() {
        let event = TradeEvent::new(EventKind::Buy, 1500.0, 3.2, 1).with_note("step=1");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"BUY\""));
        assert!(json.contains("\"note\":\"step=1\""));
    }

    #[test]
    fn test_snapshot_roundtrip_fields() {
        let snap = EngineSnapshot {
            price: 1490.0,
            positions: 2,
            avg_price: 1495.0,
            today_realized_pnl: 120.5,
            volatility: 0.006,
            last_error: None,
        };
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"today_realized_pnl\":120.5"));
        assert!(json.contains("\"last_error\":null"));
    }
}
