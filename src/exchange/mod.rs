// Exchange capability set consumed by the control loop
pub mod paper;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{Balance, Candle, Market, Order, OrderBook, Ticker, Trade};

pub use paper::PaperExchange;

/// Failures surfaced at the facade boundary
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    #[error("unknown market {0}")]
    UnknownMarket(String),

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("insufficient funds in {currency}: need {needed}, have {available}")]
    InsufficientFunds {
        currency: String,
        needed: f64,
        available: f64,
    },

    #[error("transport error: {0}")]
    Transport(String),
}

/// What a cancel request applies to
#[derive(Debug, Clone, PartialEq)]
pub enum CancelScope {
    Order(String),
    Market(Market),
    All,
}

/// Core capability set every exchange adapter provides
///
/// Adapters own their own pacing. Callers may invoke methods concurrently.
#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    /// Resolve an exchange symbol into market metadata
    async fn market(&self, symbol: &str) -> Result<Market, ExchangeError>;

    /// Buy. `rate = None` places a market order.
    async fn bid(
        &self,
        market: &Market,
        rate: Option<f64>,
        quantity: f64,
    ) -> Result<Order, ExchangeError>;

    /// Sell. `rate = None` places a market order.
    async fn ask(
        &self,
        market: &Market,
        rate: Option<f64>,
        quantity: f64,
    ) -> Result<Order, ExchangeError>;

    async fn cancel(&self, scope: CancelScope) -> Result<Vec<Order>, ExchangeError>;

    async fn orders(&self, market: Option<&Market>) -> Result<Vec<Order>, ExchangeError>;

    async fn balance(&self) -> Result<BTreeMap<String, Balance>, ExchangeError>;

    async fn order_book(&self, market: &Market) -> Result<OrderBook, ExchangeError>;

    /// Tickers for one market, or every market when `None`
    async fn ticker(&self, market: Option<&Market>) -> Result<Vec<Ticker>, ExchangeError>;

    /// Candles ascending by time, at or after `start` when given
    async fn candles(
        &self,
        market: &Market,
        start: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;

    /// Our recent fills in a market
    async fn trades(&self, market: &Market) -> Result<Vec<Trade>, ExchangeError>;

    /// Present when the exchange reports signed positions
    fn as_position_aware(&self) -> Option<&dyn PositionAware> {
        None
    }

    /// Present when the exchange can flatten every open position at once
    fn as_flattenable(&self) -> Option<&dyn Flattenable> {
        None
    }
}

#[async_trait]
pub trait PositionAware: Send + Sync {
    /// Signed quantity: positive long, negative short
    async fn position(&self, market: &Market) -> Result<f64, ExchangeError>;
}

#[async_trait]
pub trait Flattenable: Send + Sync {
    async fn close_positions(&self) -> Result<Vec<Order>, ExchangeError>;
}
