//! Grid Trading Bot Library
//!
//! Volatility-adaptive grid/split-buy trading over resilient exchange
//! adapters.

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod exchange;
pub mod strategy;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
