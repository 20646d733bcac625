use std::sync::Arc;

use async_trait::async_trait;

use super::Strategy;
use crate::error::BotError;
use crate::exchange::{CancelScope, Exchange};
use crate::models::{Market, Order};
use crate::Result;

/// Half of the quoted spread around the ticker mid
pub const QUOTE_OFFSET: f64 = 0.05;

/// Round to the 8 decimals exchanges accept for rates
fn round8(value: f64) -> f64 {
    (value * 1e8).round() / 1e8
}

/// Basic market maker
///
/// Each cycle replaces the market's quotes with one bid and one ask of the
/// minimum increment, 5% either side of the ticker mid.
pub struct QuotingStrategy {
    exchange: Arc<dyn Exchange>,
}

impl QuotingStrategy {
    pub fn new(exchange: Arc<dyn Exchange>) -> Self {
        Self { exchange }
    }

    async fn quote(&self, market: &Market) -> Result<Vec<Order>> {
        self.exchange
            .cancel(CancelScope::Market(market.clone()))
            .await?;

        let ticker = self
            .exchange
            .ticker(Some(market))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BotError::Strategy(format!("no ticker for {}", market.pair())))?;
        let bid = ticker
            .bid
            .ok_or_else(|| BotError::Strategy(format!("no bid for {}", market.pair())))?;
        let mid = (ticker.ask + bid) / 2.0;

        let bid_rate = round8(mid * (1.0 - QUOTE_OFFSET));
        let ask_rate = round8(mid * (1.0 + QUOTE_OFFSET));

        let buy = self
            .exchange
            .bid(market, Some(bid_rate), market.increment)
            .await?;
        let sell = self
            .exchange
            .ask(market, Some(ask_rate), market.increment)
            .await?;

        tracing::debug!(market = %market.pair(), bid_rate, ask_rate, "quotes placed");
        Ok(vec![buy, sell])
    }
}

#[async_trait]
impl Strategy for QuotingStrategy {
    fn name(&self) -> &str {
        "quoting"
    }

    async fn trade(&mut self, market: &Market) -> Result<Vec<Order>> {
        match self.quote(market).await {
            Ok(orders) => Ok(orders),
            Err(err) => {
                tracing::error!(
                    market = %market.pair(),
                    error = %err,
                    "quoting failed, cancelling all orders"
                );
                if let Err(cancel_err) = self.exchange.cancel(CancelScope::All).await {
                    tracing::error!(error = %cancel_err, "cancel all failed");
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ExchangeError, PaperExchange};
    use crate::models::Side;

    fn paper() -> Arc<PaperExchange> {
        Arc::new(
            PaperExchange::new("paper")
                .with_market("ETHBTC", 0.05)
                .with_balance("BTC", 10.0),
        )
    }

    #[test]
    fn test_round8() {
        assert_eq!(round8(0.123456789), 0.12345679);
        assert_eq!(round8(1.0), 1.0);
    }

    #[tokio::test]
    async fn test_quotes_straddle_mid() {
        let exchange = paper();
        let mut strategy = QuotingStrategy::new(exchange.clone());
        let market = exchange.market("ETHBTC").await.unwrap();

        let orders = strategy.trade(&market).await.unwrap();
        assert_eq!(orders.len(), 2);

        let bid = orders.iter().find(|o| o.side == Side::Buy).unwrap();
        let ask = orders.iter().find(|o| o.side == Side::Sell).unwrap();
        assert!((bid.rate.unwrap() - 0.0475).abs() < 1e-8);
        assert!((ask.rate.unwrap() - 0.0525).abs() < 1e-8);
        assert_eq!(bid.quantity, market.increment);

        assert_eq!(exchange.orders(Some(&market)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_requote_replaces_previous_orders() {
        let exchange = paper();
        let mut strategy = QuotingStrategy::new(exchange.clone());
        let market = exchange.market("ETHBTC").await.unwrap();

        strategy.trade(&market).await.unwrap();
        strategy.trade(&market).await.unwrap();

        assert_eq!(exchange.orders(Some(&market)).await.unwrap().len(), 2);
        assert_eq!(
            exchange.calls().iter().filter(|c| *c == "cancel:ETH_BTC").count(),
            2
        );
    }

    #[tokio::test]
    async fn test_order_failure_cancels_everything() {
        let exchange = paper();
        let mut strategy = QuotingStrategy::new(exchange.clone());
        let market = exchange.market("ETHBTC").await.unwrap();

        exchange.fail_next("ask", ExchangeError::Rejected("post only".to_string()));
        let err = strategy.trade(&market).await.unwrap_err();

        assert!(matches!(err, BotError::Exchange(ExchangeError::Rejected(_))));
        assert_eq!(exchange.calls().last().map(String::as_str), Some("cancel:all"));
        assert!(exchange.orders(None).await.unwrap().is_empty());
    }
}
