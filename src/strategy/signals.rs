use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use super::Strategy;
use crate::config::SignalConfig;
use crate::error::BotError;
use crate::exchange::Exchange;
use crate::execution::{available_funds, mean_score, CandleBuffer, ExecutionAction, Executor};
use crate::indicators::Indicator;
use crate::models::{Market, Order, Side};
use crate::Result;

/// Indicator-voting strategy
///
/// On every new candle period the configured indicators each vote -1, 0 or
/// +1. The mean vote against the market's thresholds picks long, flat or
/// short, and the executor sizes at most one market order from the current
/// position, balance and order book.
pub struct SignalEngine {
    exchange: Arc<dyn Exchange>,
    buffer: CandleBuffer,
    indicators: Vec<Indicator>,
    params: HashMap<String, SignalConfig>,
    last_scores: HashMap<String, BTreeMap<String, i8>>,
}

impl SignalEngine {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        indicators: Vec<Indicator>,
        params: HashMap<String, SignalConfig>,
        candle_window: usize,
    ) -> Self {
        Self {
            exchange,
            buffer: CandleBuffer::new(candle_window),
            indicators,
            params: params
                .into_iter()
                .map(|(symbol, p)| (symbol.to_uppercase(), p))
                .collect(),
            last_scores: HashMap::new(),
        }
    }

    fn params_for(&self, market: &Market) -> Result<SignalConfig> {
        self.params
            .get(&market.symbol.to_uppercase())
            .copied()
            .ok_or_else(|| BotError::Config(format!("no params for {}", market.symbol)))
    }

    /// Score every indicator over the stored window
    ///
    /// A latest candle below `min_volume` forces all scores to 0.
    fn score(&self, market: &Market, params: &SignalConfig) -> Result<BTreeMap<String, i8>> {
        let candles = self
            .buffer
            .get_candles(&market.symbol)
            .map_err(BotError::Strategy)?;

        let quiet = candles
            .last()
            .map_or(true, |c| c.volume < params.min_volume);
        if quiet {
            tracing::debug!(market = %market.pair(), "volume below minimum, scoring neutral");
        }

        Ok(self
            .indicators
            .iter()
            .map(|indicator| {
                let score = if quiet { 0 } else { (indicator.score)(&candles) };
                (indicator.name.to_string(), score)
            })
            .collect())
    }

    async fn position(&self, market: &Market) -> Result<f64> {
        match self.exchange.as_position_aware() {
            Some(positions) => Ok(positions.position(market).await?),
            None => Ok(0.0),
        }
    }

    async fn submit(&self, market: &Market, side: Side, quantity: f64) -> Result<Order> {
        let order = match side {
            Side::Buy => self.exchange.bid(market, None, quantity).await?,
            Side::Sell => self.exchange.ask(market, None, quantity).await?,
        };
        Ok(order)
    }
}

#[async_trait]
impl Strategy for SignalEngine {
    fn name(&self) -> &str {
        "signal"
    }

    async fn trade(&mut self, market: &Market) -> Result<Vec<Order>> {
        let params = self.params_for(market)?;

        if !self
            .buffer
            .ensure_fresh(self.exchange.as_ref(), market)
            .await?
        {
            return Ok(Vec::new());
        }

        let engine = &*self;
        let (scores, position, balances, book) = tokio::try_join!(
            async { engine.score(market, &params) },
            engine.position(market),
            async { Ok::<_, BotError>(engine.exchange.balance().await?) },
            async { Ok::<_, BotError>(engine.exchange.order_book(market).await?) },
        )?;

        let votes: Vec<i8> = scores.values().copied().collect();
        let mean = mean_score(&votes);

        let base_available = balances
            .get(&market.base.to_uppercase())
            .map(|b| b.available)
            .unwrap_or(0.0);
        let funds = book
            .mid_price()
            .map(|mid| available_funds(mid, base_available));

        let decision =
            Executor::new(params, market.increment).process_signal(mean, position, funds);

        tracing::info!(
            market = %market.pair(),
            mean,
            position,
            reason = %decision.reason,
            "📊 signal evaluated"
        );
        self.last_scores.insert(market.symbol.clone(), scores);

        let order = match decision.action {
            ExecutionAction::Open { side, quantity } | ExecutionAction::Flatten { side, quantity } => {
                let order = self.submit(market, side, quantity).await?;
                tracing::info!(
                    market = %market.pair(),
                    side = ?order.side,
                    quantity = order.quantity,
                    order_id = %order.order_id,
                    "order placed"
                );
                order
            }
            ExecutionAction::Skip => return Ok(Vec::new()),
        };

        Ok(vec![order])
    }

    fn signals(&self, market: &Market) -> Option<BTreeMap<String, i8>> {
        self.last_scores.get(&market.symbol).cloned()
    }
}
