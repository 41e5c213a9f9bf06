//! Exchange adapter layer
//!
//! A uniform quote/order/balance interface over heterogeneous venues. Every
//! venue-specific failure is normalized to an [`ExchangeError`] with exactly
//! one [`ErrorKind`] before it reaches the strategy engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;

pub mod bithumb;
pub mod kis;

pub use bithumb::BithumbAdapter;
pub use kis::KisAdapter;

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// Immutable market snapshot for one poll cycle
#[derive(Debug, Clone)]
pub struct Quote {
    pub price: f64,
    pub volume_24h: f64,
    pub timestamp: DateTime<Utc>,
}

/// Venue acknowledgement of a placed order
#[derive(Debug, Clone)]
pub struct OrderResult {
    pub order_id: String,
}

/// An order resting on the venue
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub order_id: String,
    pub side: Side,
}

/// Account balance relevant to the traded pair
#[derive(Debug, Clone)]
pub struct Balance {
    /// Spendable payment-currency funds
    pub cash: f64,
    /// Held order-currency units
    pub asset: f64,
}

/// Classification of an adapter failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Auth,
    RateLimited,
    Rejected,
    Unknown,
}

/// Normalized adapter error; venue-specific errors never escape the adapter
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Unknown exchange error: {0}")]
    Unknown(String),
}

impl ExchangeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExchangeError::Network(_) => ErrorKind::Network,
            ExchangeError::Auth(_) => ErrorKind::Auth,
            ExchangeError::RateLimited(_) => ErrorKind::RateLimited,
            ExchangeError::Rejected(_) => ErrorKind::Rejected,
            ExchangeError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Transient failures that may succeed on the alternate request path
    pub fn is_failover_eligible(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Network | ErrorKind::RateLimited | ErrorKind::Unknown
        )
    }

}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            ExchangeError::Network(e.to_string())
        } else if e.is_decode() {
            ExchangeError::Unknown(format!("response decode failed: {e}"))
        } else {
            ExchangeError::Unknown(e.to_string())
        }
    }
}

/// Map an HTTP status to an error kind shared by all venues
pub(crate) fn error_from_status(status: reqwest::StatusCode, body: &str) -> ExchangeError {
    let message = format!("HTTP {status}: {body}");
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        ExchangeError::Auth(message)
    } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        ExchangeError::RateLimited(message)
    } else if status.is_server_error() || status == reqwest::StatusCode::REQUEST_TIMEOUT {
        ExchangeError::Network(message)
    } else {
        ExchangeError::Unknown(message)
    }
}

pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;

/// Uniform capability interface consumed by the strategy engine
#[async_trait]
pub trait ExchangeAdapter: Send {
    /// Short venue name used in logs
    fn venue(&self) -> &'static str;

    async fn get_quote(&mut self) -> ExchangeResult<Quote>;

    async fn place_order(&mut self, side: Side, qty: f64, price: f64)
        -> ExchangeResult<OrderResult>;

    async fn cancel_order(&mut self, order_id: &str, side: Side) -> ExchangeResult<()>;

    async fn get_balance(&mut self) -> ExchangeResult<Balance>;

    async fn get_open_orders(&mut self) -> ExchangeResult<Vec<OpenOrder>>;

    /// Round a price to the venue's tick
    fn round_price(&self, price: f64) -> f64 {
        price
    }

    /// Round a quantity to the venue's lot; may round to zero, which the
    /// caller must treat as not submittable
    fn round_quantity(&self, qty: f64) -> f64 {
        qty
    }

    /// Convert an order value to a raw quantity at the given price
    fn value_to_quantity(&self, order_value: f64, price: f64) -> f64 {
        if price <= 0.0 {
            return 0.0;
        }
        order_value / price
    }

    /// Minimum notional the venue accepts for a spot order
    fn min_notional(&self) -> f64 {
        0.0
    }

    /// Whether a rounded order still satisfies the venue's limits.
    /// Rounding can leave the notional a few micro-units short of the
    /// minimum, so a tiny epsilon is allowed.
    fn is_notional_sufficient(&self, notional: f64, qty: f64) -> bool {
        let epsilon = f64::max(1e-6, self.min_notional() * 1e-6);
        qty > 0.0 && notional + epsilon >= self.min_notional()
    }
}

/// Select the venue implementation once at startup
pub fn create_adapter(config: &Config) -> crate::Result<Box<dyn ExchangeAdapter>> {
    match config.bot.exchange.to_lowercase().as_str() {
        "bithumb" => Ok(Box::new(BithumbAdapter::new(
            config.bithumb.clone(),
            config.bot.clone(),
        ))),
        "kis" => Ok(Box::new(KisAdapter::new(
            config.kis.clone(),
            config.bot.dry_run,
        ))),
        other => Err(crate::Error::UnsupportedExchange(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        assert_eq!(
            ExchangeError::Network("timeout".into()).kind(),
            ErrorKind::Network
        );
        assert_eq!(
            ExchangeError::Rejected("below min notional".into()).kind(),
            ErrorKind::Rejected
        );
    }

    #[test]
    fn test_failover_eligibility() {
        assert!(ExchangeError::Network("x".into()).is_failover_eligible());
        assert!(ExchangeError::RateLimited("x".into()).is_failover_eligible());
        assert!(ExchangeError::Unknown("x".into()).is_failover_eligible());
        assert!(!ExchangeError::Auth("x".into()).is_failover_eligible());
        assert!(!ExchangeError::Rejected("x".into()).is_failover_eligible());
    }

    #[test]
    fn test_status_mapping() {
        use reqwest::StatusCode;
        assert_eq!(
            error_from_status(StatusCode::UNAUTHORIZED, "").kind(),
            ErrorKind::Auth
        );
        assert_eq!(
            error_from_status(StatusCode::TOO_MANY_REQUESTS, "").kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(
            error_from_status(StatusCode::INTERNAL_SERVER_ERROR, "").kind(),
            ErrorKind::Network
        );
        assert_eq!(
            error_from_status(StatusCode::BAD_REQUEST, "").kind(),
            ErrorKind::Unknown
        );
    }
}
