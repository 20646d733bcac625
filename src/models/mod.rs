use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tradable currency pair on one exchange
///
/// Prices are quoted in `base` per unit of `counter`; order quantities are
/// denominated in `counter`. `ETH_BTC` trades ETH priced in BTC.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Market {
    pub counter: String,
    pub base: String,
    pub symbol: String,
    pub increment: f64,
    pub maker_fee: f64,
    pub taker_fee: f64,
}

impl Market {
    /// Pair id used by commands and reports, e.g. `ETH_BTC`
    pub fn pair(&self) -> String {
        format!("{}_{}", self.counter.to_uppercase(), self.base.to_uppercase())
    }
}

/// OHLCV candlestick for one period of one market
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// Order as reported by the exchange. `rate` is `None` for market orders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub order_id: String,
    pub market: String,
    pub side: Side,
    pub rate: Option<f64>,
    pub quantity: f64,
    pub time: DateTime<Utc>,
}

/// Fill against one of our orders
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub trade_id: String,
    pub order_id: String,
    pub market: String,
    pub side: Side,
    pub rate: f64,
    pub quantity: f64,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Balance {
    pub available: f64,
    pub reserved: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    pub rate: f64,
    pub quantity: f64,
}

/// Order book snapshot, best price first on both sides
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OrderBook {
    pub asks: Vec<Entry>,
    pub bids: Vec<Entry>,
}

impl OrderBook {
    /// `best_bid + (best_ask - best_bid) / 2`, if both sides have a level
    pub fn mid_price(&self) -> Option<f64> {
        let best_ask = self.asks.first()?.rate;
        let best_bid = self.bids.first()?.rate;
        Some(best_bid + (best_ask - best_bid) / 2.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ticker {
    pub market: String,
    pub ask: f64,
    pub bid: Option<f64>,
    pub low: f64,
    pub high: f64,
    pub last: f64,
    pub base_volume: f64,
    pub quote_volume: f64,
    pub time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth_btc() -> Market {
        Market {
            counter: "eth".to_string(),
            base: "btc".to_string(),
            symbol: "ETHBTC".to_string(),
            increment: 0.001,
            maker_fee: 0.001,
            taker_fee: 0.002,
        }
    }

    #[test]
    fn test_pair_is_upper_case() {
        assert_eq!(eth_btc().pair(), "ETH_BTC");
    }

    #[test]
    fn test_mid_price() {
        let book = OrderBook {
            asks: vec![Entry { rate: 102.0, quantity: 1.0 }, Entry { rate: 103.0, quantity: 1.0 }],
            bids: vec![Entry { rate: 98.0, quantity: 1.0 }],
        };
        assert_eq!(book.mid_price(), Some(100.0));
    }

    #[test]
    fn test_mid_price_empty_side() {
        let book = OrderBook {
            asks: vec![],
            bids: vec![Entry { rate: 98.0, quantity: 1.0 }],
        };
        assert!(book.mid_price().is_none());
    }

    #[test]
    fn test_side_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"buy\"");
    }
}
