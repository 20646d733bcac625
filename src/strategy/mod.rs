// Trading strategy module
pub mod quoting;
pub mod signals;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::models::{Market, Order};
use crate::Result;

pub use quoting::QuotingStrategy;
pub use signals::SignalEngine;

/// Base trait for all trading strategies
///
/// The control loop calls `trade` once per cycle for every enabled market.
/// Any error is fatal to the session.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Get strategy name
    fn name(&self) -> &str;

    /// Evaluate one market and place whatever orders it calls for
    async fn trade(&mut self, market: &Market) -> Result<Vec<Order>>;

    /// Latest per-indicator scores for a market, if the strategy has any
    fn signals(&self, _market: &Market) -> Option<BTreeMap<String, i8>> {
        None
    }
}
