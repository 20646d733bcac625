use crate::error::BotError;
use crate::exchange::Exchange;
use crate::models::{Candle, Market};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

/// A stored window older than this is refreshed from the exchange
pub const STALE_AFTER_SECS: i64 = 60;
/// Added to the last stored timestamp so the boundary candle is not fetched twice
pub const BOUNDARY_GRACE_SECS: i64 = 5;

/// Thread-safe in-memory buffer for candle data
///
/// Maintains a rolling window of candles for each market symbol. Every
/// window is strictly increasing in time and never longer than `max_candles`.
#[derive(Clone)]
pub struct CandleBuffer {
    data: Arc<RwLock<HashMap<String, VecDeque<Candle>>>>,
    max_candles: usize,
}

impl CandleBuffer {
    /// Create a new candle buffer
    ///
    /// # Arguments
    /// * `max_candles` - Maximum number of candles to keep per market
    pub fn new(max_candles: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            max_candles,
        }
    }

    pub fn max_candles(&self) -> usize {
        self.max_candles
    }

    /// Append candles for a market
    ///
    /// Candles not strictly newer than the current last one are dropped, then
    /// the window is trimmed from the front. Returns how many were appended.
    pub fn add_candles(&self, symbol: &str, candles: Vec<Candle>) -> Result<usize, String> {
        let mut data = self.data.write().map_err(|e| e.to_string())?;

        let window = data.entry(symbol.to_string()).or_default();

        let mut appended = 0;
        for candle in candles {
            if window
                .back()
                .map_or(true, |last| candle.timestamp > last.timestamp)
            {
                window.push_back(candle);
                appended += 1;
            }
        }

        // Remove oldest if exceeds max
        while window.len() > self.max_candles {
            window.pop_front();
        }

        Ok(appended)
    }

    /// Get all candles for a market, oldest first
    pub fn get_candles(&self, symbol: &str) -> Result<Vec<Candle>, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;

        Ok(data
            .get(symbol)
            .map(|deque| deque.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Most recent candle for a market
    pub fn latest(&self, symbol: &str) -> Result<Option<Candle>, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        Ok(data.get(symbol).and_then(|deque| deque.back().cloned()))
    }

    /// Get count of candles for a market
    pub fn candle_count(&self, symbol: &str) -> Result<usize, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        Ok(data.get(symbol).map(|d| d.len()).unwrap_or(0))
    }

    /// Bring a market's window up to date
    ///
    /// Returns true only when new candles were appended. No exchange call is
    /// made while the newest stored candle is less than a minute old.
    pub async fn ensure_fresh(
        &self,
        exchange: &dyn Exchange,
        market: &Market,
    ) -> Result<bool, BotError> {
        self.ensure_fresh_at(exchange, market, Utc::now()).await
    }

    pub async fn ensure_fresh_at(
        &self,
        exchange: &dyn Exchange,
        market: &Market,
        now: DateTime<Utc>,
    ) -> Result<bool, BotError> {
        let latest = self.latest(&market.symbol).map_err(BotError::Strategy)?;

        let fetched = match latest {
            None => {
                tracing::debug!(market = %market.symbol, "loading candle history");
                exchange.candles(market, None, self.max_candles).await?
            }
            Some(last) => {
                if now - last.timestamp <= Duration::seconds(STALE_AFTER_SECS) {
                    return Ok(false);
                }
                let start = last.timestamp + Duration::seconds(BOUNDARY_GRACE_SECS);
                exchange.candles(market, Some(start), self.max_candles).await?
            }
        };

        let appended = self
            .add_candles(&market.symbol, fetched)
            .map_err(BotError::Strategy)?;

        if appended > 0 {
            tracing::debug!(market = %market.symbol, appended, "new candle period");
        }
        Ok(appended > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperExchange;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn create_test_candle(minute: i64, price: f64) -> Candle {
        Candle {
            timestamp: start() + Duration::minutes(minute),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 1000.0,
        }
    }

    fn series(from: i64, to: i64) -> Vec<Candle> {
        (from..to)
            .map(|i| create_test_candle(i, 100.0 + i as f64))
            .collect()
    }

    #[test]
    fn test_new_buffer() {
        let buffer = CandleBuffer::new(100);
        assert_eq!(buffer.max_candles(), 100);
        assert_eq!(buffer.candle_count("ETHBTC").unwrap(), 0);
    }

    #[test]
    fn test_max_candles_limit() {
        let buffer = CandleBuffer::new(5);

        buffer.add_candles("ETHBTC", series(0, 10)).unwrap();

        let candles = buffer.get_candles("ETHBTC").unwrap();
        assert_eq!(candles.len(), 5); // Should only keep last 5
        assert_eq!(candles[0].close, 105.0);
        assert_eq!(candles[4].close, 109.0);
    }

    #[test]
    fn test_stale_and_duplicate_candles_dropped() {
        let buffer = CandleBuffer::new(100);
        buffer.add_candles("ETHBTC", series(0, 3)).unwrap();

        let appended = buffer
            .add_candles("ETHBTC", vec![create_test_candle(1, 1.0), create_test_candle(2, 1.0)])
            .unwrap();
        assert_eq!(appended, 0);

        let appended = buffer.add_candles("ETHBTC", series(2, 5)).unwrap();
        assert_eq!(appended, 2);

        let candles = buffer.get_candles("ETHBTC").unwrap();
        assert!(candles.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_multiple_markets() {
        let buffer = CandleBuffer::new(100);

        buffer.add_candles("ETHBTC", series(0, 2)).unwrap();
        buffer.add_candles("XBTUSD", series(0, 3)).unwrap();

        assert_eq!(buffer.candle_count("ETHBTC").unwrap(), 2);
        assert_eq!(buffer.candle_count("XBTUSD").unwrap(), 3);
    }

    #[test]
    fn test_thread_safety() {
        use std::thread;

        let buffer = CandleBuffer::new(100);
        let buffer_clone = buffer.clone();

        let handle = thread::spawn(move || {
            for i in 0..50 {
                buffer_clone
                    .add_candles("ETHBTC", vec![create_test_candle(i, 100.0)])
                    .unwrap();
            }
        });

        for i in 0..50 {
            buffer
                .add_candles("XBTUSD", vec![create_test_candle(i, 100.0)])
                .unwrap();
        }

        handle.join().unwrap();

        assert_eq!(buffer.candle_count("ETHBTC").unwrap(), 50);
        assert_eq!(buffer.candle_count("XBTUSD").unwrap(), 50);
    }

    #[tokio::test]
    async fn test_ensure_fresh_first_call_loads_history() {
        let exchange = PaperExchange::new("paper").with_market("ETHBTC", 100.0);
        exchange.set_candles("ETHBTC", series(0, 150));
        let market = exchange.market("ETHBTC").await.unwrap();
        let buffer = CandleBuffer::new(100);

        let now = start() + Duration::minutes(150);
        assert!(buffer.ensure_fresh_at(&exchange, &market, now).await.unwrap());

        let candles = buffer.get_candles("ETHBTC").unwrap();
        assert_eq!(candles.len(), 100);
        assert_eq!(candles.last().unwrap().timestamp, start() + Duration::minutes(149));
    }

    #[tokio::test]
    async fn test_ensure_fresh_is_noop_within_a_minute() {
        let exchange = PaperExchange::new("paper").with_market("ETHBTC", 100.0);
        exchange.set_candles("ETHBTC", series(0, 10));
        let market = exchange.market("ETHBTC").await.unwrap();
        let buffer = CandleBuffer::new(100);

        let last = start() + Duration::minutes(9);
        assert!(buffer.ensure_fresh_at(&exchange, &market, last).await.unwrap());

        // A failing candles call proves no network access happens while fresh
        exchange.fail_next(
            "candles",
            crate::exchange::ExchangeError::Transport("should not be called".to_string()),
        );
        let fresh = last + Duration::seconds(30);
        assert!(!buffer.ensure_fresh_at(&exchange, &market, fresh).await.unwrap());
        assert!(!buffer.ensure_fresh_at(&exchange, &market, fresh).await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_fresh_appends_new_period() {
        let exchange = PaperExchange::new("paper").with_market("ETHBTC", 100.0);
        exchange.set_candles("ETHBTC", series(0, 100));
        let market = exchange.market("ETHBTC").await.unwrap();
        let buffer = CandleBuffer::new(100);

        let mut now = start() + Duration::minutes(100);
        assert!(buffer.ensure_fresh_at(&exchange, &market, now).await.unwrap());

        // Stale but nothing new yet
        now += Duration::minutes(1);
        assert!(!buffer.ensure_fresh_at(&exchange, &market, now).await.unwrap());

        exchange.push_candles("ETHBTC", series(100, 102));
        assert!(buffer.ensure_fresh_at(&exchange, &market, now).await.unwrap());

        let candles = buffer.get_candles("ETHBTC").unwrap();
        assert_eq!(candles.len(), 100);
        assert_eq!(candles[0].timestamp, start() + Duration::minutes(2));
        assert_eq!(candles[99].timestamp, start() + Duration::minutes(101));
    }
}
