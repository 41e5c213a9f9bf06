//! Grid strategy
//!
//! The engine polls one venue through an [`ExchangeAdapter`], estimates
//! volatility from the price stream, and keeps a descending grid of
//! split buys with volatility-scaled exit thresholds.
//!
//! [`ExchangeAdapter`]: crate::exchange::ExchangeAdapter

pub mod backoff;
pub mod book;
pub mod engine;
pub mod rate;
pub mod volatility;

pub use backoff::{FailureBackoff, OpCategory};
pub use book::{ExitCandidate, ExitReason, Position, PositionBook};
pub use engine::StrategyEngine;
pub use rate::RateGovernor;
pub use volatility::VolatilityEstimator;
