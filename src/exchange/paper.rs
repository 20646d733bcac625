use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use governor::{Quota, RateLimiter};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use super::{CancelScope, Exchange, ExchangeError, Flattenable, PositionAware};
use crate::models::{Balance, Candle, Entry, Market, Order, OrderBook, Side, Ticker, Trade};

const QUOTE_CURRENCIES: &[&str] = &["USDT", "USD", "BTC", "ETH"];
const CANDLE_PERIOD_SECS: i64 = 60;
const HISTORY_CANDLES: usize = 100;
const DEFAULT_INCREMENT: f64 = 0.001;
const DEFAULT_SPREAD: f64 = 0.002;
const MAX_TRADES: usize = 50;

type PaperRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

struct MarketBook {
    market: Market,
    price: f64,
    position: f64,
    candles: Vec<Candle>,
    synthetic: bool,
}

struct PaperState {
    books: HashMap<String, MarketBook>,
    balances: BTreeMap<String, Balance>,
    open_orders: Vec<Order>,
    trades: Vec<Trade>,
    calls: Vec<String>,
    failures: HashMap<String, ExchangeError>,
    rng: StdRng,
}

/// In-memory exchange simulation
///
/// Fills market orders at mid, rests limit orders until cancelled, tracks
/// signed positions, and generates one-minute candles by seeded random walk
/// unless a market has been given scripted candles.
pub struct PaperExchange {
    name: String,
    state: Mutex<PaperState>,
    rate_limiter: Arc<PaperRateLimiter>,
    positions_enabled: bool,
    flattening_enabled: bool,
}

impl PaperExchange {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(PaperState {
                books: HashMap::new(),
                balances: BTreeMap::new(),
                open_orders: Vec::new(),
                trades: Vec::new(),
                calls: Vec::new(),
                failures: HashMap::new(),
                rng: StdRng::seed_from_u64(42),
            }),
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_second(
                NonZeroU32::new(100).unwrap_or(NonZeroU32::MIN),
            ))),
            positions_enabled: true,
            flattening_enabled: true,
        }
    }

    pub fn with_seed(self, seed: u64) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.rng = StdRng::seed_from_u64(seed);
        }
        self
    }

    /// Cap outbound calls per second
    pub fn with_requests_per_second(mut self, requests: u32) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN));
        self.rate_limiter = Arc::new(RateLimiter::direct(quota));
        self
    }

    /// List a symbol, inferring counter/base from its quote suffix
    pub fn with_market(self, symbol: &str, price: f64) -> Self {
        match split_symbol(symbol) {
            Some((counter, base)) => self.with_listed_market(
                Market {
                    counter,
                    base,
                    symbol: symbol.to_string(),
                    increment: DEFAULT_INCREMENT,
                    maker_fee: 0.001,
                    taker_fee: 0.002,
                },
                price,
            ),
            None => {
                tracing::warn!(symbol, "cannot infer currencies, market not listed");
                self
            }
        }
    }

    pub fn with_listed_market(self, market: Market, price: f64) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.books.insert(
                market.symbol.clone(),
                MarketBook {
                    market,
                    price,
                    position: 0.0,
                    candles: Vec::new(),
                    synthetic: true,
                },
            );
        }
        self
    }

    pub fn with_balance(self, currency: &str, available: f64) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.balances.insert(
                currency.to_uppercase(),
                Balance {
                    available,
                    reserved: 0.0,
                },
            );
        }
        self
    }

    /// Model an exchange without position reporting
    pub fn without_positions(mut self) -> Self {
        self.positions_enabled = false;
        self
    }

    /// Model an exchange without a close-all-positions endpoint
    pub fn without_flattening(mut self) -> Self {
        self.flattening_enabled = false;
        self
    }

    /// Serve these candles instead of synthetic ones
    pub fn set_candles(&self, symbol: &str, candles: Vec<Candle>) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(book) = state.books.get_mut(symbol) {
                if let Some(last) = candles.last() {
                    book.price = last.close;
                }
                book.candles = candles;
                book.synthetic = false;
            }
        }
    }

    pub fn push_candles(&self, symbol: &str, candles: Vec<Candle>) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(book) = state.books.get_mut(symbol) {
                if let Some(last) = candles.last() {
                    book.price = last.close;
                }
                book.candles.extend(candles);
                book.synthetic = false;
            }
        }
    }

    pub fn set_position(&self, symbol: &str, position: f64) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(book) = state.books.get_mut(symbol) {
                book.position = position;
            }
        }
    }

    /// Make the next call to `method` fail with `error`
    pub fn fail_next(&self, method: &str, error: ExchangeError) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.insert(method.to_string(), error);
        }
    }

    /// Log of mutating calls, e.g. `bid:ETH_BTC:0.3`, `cancel:all`
    pub fn calls(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.calls.clone())
            .unwrap_or_default()
    }

    pub fn position_of(&self, symbol: &str) -> f64 {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.books.get(symbol).map(|b| b.position))
            .unwrap_or(0.0)
    }

    async fn pace(&self) {
        self.rate_limiter.until_ready().await;
    }

    fn lock(&self) -> Result<MutexGuard<'_, PaperState>, ExchangeError> {
        self.state
            .lock()
            .map_err(|e| ExchangeError::Transport(e.to_string()))
    }

    fn place(
        &self,
        market: &Market,
        side: Side,
        rate: Option<f64>,
        quantity: f64,
    ) -> Result<Order, ExchangeError> {
        let mut state = self.lock()?;
        let method = match side {
            Side::Buy => "bid",
            Side::Sell => "ask",
        };
        take_failure(&mut state, method)?;
        state
            .calls
            .push(format!("{}:{}:{}", method, market.pair(), quantity));

        if quantity <= 0.0 || !quantity.is_finite() {
            return Err(ExchangeError::Rejected(format!(
                "invalid quantity {}",
                quantity
            )));
        }

        let price = state
            .books
            .get(&market.symbol)
            .map(|b| b.price)
            .ok_or_else(|| ExchangeError::UnknownMarket(market.symbol.clone()))?;

        let marketable = match (side, rate) {
            (_, None) => true,
            (Side::Buy, Some(r)) => r >= price * (1.0 + DEFAULT_SPREAD / 2.0),
            (Side::Sell, Some(r)) => r <= price * (1.0 - DEFAULT_SPREAD / 2.0),
        };

        let order = Order {
            order_id: Uuid::new_v4().to_string(),
            market: market.pair(),
            side,
            rate,
            quantity,
            time: Utc::now(),
        };

        if marketable {
            fill(&mut state, market, &order, rate.unwrap_or(price))?;
        } else {
            if side == Side::Buy {
                let cost = quantity * rate.unwrap_or(price);
                let balance = state.balances.entry(market.base.to_uppercase()).or_default();
                if balance.available < cost {
                    return Err(ExchangeError::InsufficientFunds {
                        currency: market.base.to_uppercase(),
                        needed: cost,
                        available: balance.available,
                    });
                }
                balance.available -= cost;
                balance.reserved += cost;
            }
            state.open_orders.push(order.clone());
        }

        Ok(order)
    }
}

fn take_failure(state: &mut PaperState, method: &str) -> Result<(), ExchangeError> {
    match state.failures.remove(method) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn fill(
    state: &mut PaperState,
    market: &Market,
    order: &Order,
    rate: f64,
) -> Result<(), ExchangeError> {
    let base = market.base.to_uppercase();
    let notional = order.quantity * rate;
    let fee = notional * market.taker_fee;
    let balance = state.balances.entry(base.clone()).or_default();

    match order.side {
        Side::Buy => {
            if balance.available < notional + fee {
                return Err(ExchangeError::InsufficientFunds {
                    currency: base,
                    needed: notional + fee,
                    available: balance.available,
                });
            }
            balance.available -= notional + fee;
        }
        Side::Sell => balance.available += notional - fee,
    }

    if let Some(book) = state.books.get_mut(&market.symbol) {
        book.position += match order.side {
            Side::Buy => order.quantity,
            Side::Sell => -order.quantity,
        };
    }

    state.trades.push(Trade {
        trade_id: Uuid::new_v4().to_string(),
        order_id: order.order_id.clone(),
        market: market.pair(),
        side: order.side,
        rate,
        quantity: order.quantity,
        time: order.time,
    });
    if state.trades.len() > MAX_TRADES {
        let excess = state.trades.len() - MAX_TRADES;
        state.trades.drain(..excess);
    }

    Ok(())
}

fn release(state: &mut PaperState, order: &Order, base: &str) {
    if order.side != Side::Buy {
        return;
    }
    if let Some(rate) = order.rate {
        let balance = state.balances.entry(base.to_string()).or_default();
        let reserved = order.quantity * rate;
        balance.reserved -= reserved;
        balance.available += reserved;
    }
}

/// `ETHBTC` / `ETH_BTC` -> (`ETH`, `BTC`)
fn split_symbol(symbol: &str) -> Option<(String, String)> {
    let upper = symbol.to_uppercase();
    if let Some((counter, base)) = upper.split_once('_') {
        return Some((counter.to_string(), base.to_string()));
    }
    QUOTE_CURRENCIES.iter().find_map(|quote| {
        upper
            .strip_suffix(quote)
            .filter(|counter| !counter.is_empty())
            .map(|counter| (counter.to_string(), quote.to_string()))
    })
}

/// Open time of the most recently closed one-minute candle
fn last_closed_open(now: DateTime<Utc>) -> DateTime<Utc> {
    let period = Duration::seconds(CANDLE_PERIOD_SECS);
    now.duration_trunc(period).unwrap_or(now) - period
}

fn extend_synthetic(book: &mut MarketBook, rng: &mut StdRng, now: DateTime<Utc>) {
    if !book.synthetic {
        return;
    }
    let period = Duration::seconds(CANDLE_PERIOD_SECS);
    let last_closed = last_closed_open(now);
    let mut next = match book.candles.last() {
        Some(last) => last.timestamp + period,
        None => last_closed - period * (HISTORY_CANDLES as i32 - 1),
    };

    while next <= last_closed {
        let open = book.price;
        let close = open * (1.0 + rng.gen_range(-0.004..0.004));
        let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.002));
        let low = open.min(close) * (1.0 - rng.gen_range(0.0..0.002));
        book.candles.push(Candle {
            timestamp: next,
            open,
            high,
            low,
            close,
            volume: rng.gen_range(5.0..50.0),
        });
        book.price = close;
        next += period;
    }

    if book.candles.len() > HISTORY_CANDLES * 2 {
        let excess = book.candles.len() - HISTORY_CANDLES * 2;
        book.candles.drain(..excess);
    }
}

fn depth(price: f64, side: Side) -> Vec<Entry> {
    (1..=3)
        .map(|level| {
            let offset = DEFAULT_SPREAD / 2.0 * level as f64;
            let rate = match side {
                Side::Sell => price * (1.0 + offset),
                Side::Buy => price * (1.0 - offset),
            };
            Entry {
                rate,
                quantity: level as f64,
            }
        })
        .collect()
}

fn ticker_for(book: &MarketBook) -> Ticker {
    let last_candle = book.candles.last();
    Ticker {
        market: book.market.pair(),
        ask: book.price * (1.0 + DEFAULT_SPREAD / 2.0),
        bid: Some(book.price * (1.0 - DEFAULT_SPREAD / 2.0)),
        low: last_candle.map(|c| c.low).unwrap_or(book.price),
        high: last_candle.map(|c| c.high).unwrap_or(book.price),
        last: book.price,
        base_volume: last_candle.map(|c| c.volume).unwrap_or(0.0),
        quote_volume: last_candle.map(|c| c.volume * c.close).unwrap_or(0.0),
        time: Utc::now(),
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn market(&self, symbol: &str) -> Result<Market, ExchangeError> {
        self.pace().await;
        let mut state = self.lock()?;
        take_failure(&mut state, "market")?;
        state
            .books
            .get(symbol)
            .map(|b| b.market.clone())
            .ok_or_else(|| ExchangeError::UnknownMarket(symbol.to_string()))
    }

    async fn bid(
        &self,
        market: &Market,
        rate: Option<f64>,
        quantity: f64,
    ) -> Result<Order, ExchangeError> {
        self.pace().await;
        self.place(market, Side::Buy, rate, quantity)
    }

    async fn ask(
        &self,
        market: &Market,
        rate: Option<f64>,
        quantity: f64,
    ) -> Result<Order, ExchangeError> {
        self.pace().await;
        self.place(market, Side::Sell, rate, quantity)
    }

    async fn cancel(&self, scope: CancelScope) -> Result<Vec<Order>, ExchangeError> {
        self.pace().await;
        let mut state = self.lock()?;
        take_failure(&mut state, "cancel")?;

        let label = match &scope {
            CancelScope::All => "all".to_string(),
            CancelScope::Market(market) => market.pair(),
            CancelScope::Order(id) => id.clone(),
        };
        state.calls.push(format!("cancel:{}", label));

        let (cancelled, kept): (Vec<Order>, Vec<Order>) =
            std::mem::take(&mut state.open_orders)
                .into_iter()
                .partition(|order| match &scope {
                    CancelScope::All => true,
                    CancelScope::Market(market) => order.market == market.pair(),
                    CancelScope::Order(id) => &order.order_id == id,
                });
        state.open_orders = kept;

        for order in &cancelled {
            let base = state
                .books
                .values()
                .find(|b| b.market.pair() == order.market)
                .map(|b| b.market.base.to_uppercase());
            if let Some(base) = base {
                release(&mut state, order, &base);
            }
        }

        Ok(cancelled)
    }

    async fn orders(&self, market: Option<&Market>) -> Result<Vec<Order>, ExchangeError> {
        self.pace().await;
        let mut state = self.lock()?;
        take_failure(&mut state, "orders")?;
        Ok(state
            .open_orders
            .iter()
            .filter(|o| market.map_or(true, |m| o.market == m.pair()))
            .cloned()
            .collect())
    }

    async fn balance(&self) -> Result<BTreeMap<String, Balance>, ExchangeError> {
        self.pace().await;
        let mut state = self.lock()?;
        take_failure(&mut state, "balance")?;
        Ok(state.balances.clone())
    }

    async fn order_book(&self, market: &Market) -> Result<OrderBook, ExchangeError> {
        self.pace().await;
        let mut state = self.lock()?;
        take_failure(&mut state, "order_book")?;
        let price = state
            .books
            .get(&market.symbol)
            .map(|b| b.price)
            .ok_or_else(|| ExchangeError::UnknownMarket(market.symbol.clone()))?;
        Ok(OrderBook {
            asks: depth(price, Side::Sell),
            bids: depth(price, Side::Buy),
        })
    }

    async fn ticker(&self, market: Option<&Market>) -> Result<Vec<Ticker>, ExchangeError> {
        self.pace().await;
        let mut state = self.lock()?;
        take_failure(&mut state, "ticker")?;
        match market {
            Some(market) => state
                .books
                .get(&market.symbol)
                .map(|b| vec![ticker_for(b)])
                .ok_or_else(|| ExchangeError::UnknownMarket(market.symbol.clone())),
            None => Ok(state.books.values().map(ticker_for).collect()),
        }
    }

    async fn candles(
        &self,
        market: &Market,
        start: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.pace().await;
        let mut state = self.lock()?;
        take_failure(&mut state, "candles")?;

        let PaperState { books, rng, .. } = &mut *state;
        let book = books
            .get_mut(&market.symbol)
            .ok_or_else(|| ExchangeError::UnknownMarket(market.symbol.clone()))?;
        extend_synthetic(book, rng, Utc::now());

        let candles = match start {
            Some(start) => book
                .candles
                .iter()
                .filter(|c| c.timestamp >= start)
                .take(limit)
                .cloned()
                .collect(),
            None => {
                let skip = book.candles.len().saturating_sub(limit);
                book.candles[skip..].to_vec()
            }
        };
        Ok(candles)
    }

    async fn trades(&self, market: &Market) -> Result<Vec<Trade>, ExchangeError> {
        self.pace().await;
        let mut state = self.lock()?;
        take_failure(&mut state, "trades")?;
        Ok(state
            .trades
            .iter()
            .filter(|t| t.market == market.pair())
            .cloned()
            .collect())
    }

    fn as_position_aware(&self) -> Option<&dyn PositionAware> {
        if self.positions_enabled {
            Some(self)
        } else {
            None
        }
    }

    fn as_flattenable(&self) -> Option<&dyn Flattenable> {
        if self.flattening_enabled {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl PositionAware for PaperExchange {
    async fn position(&self, market: &Market) -> Result<f64, ExchangeError> {
        self.pace().await;
        let mut state = self.lock()?;
        take_failure(&mut state, "position")?;
        state
            .books
            .get(&market.symbol)
            .map(|b| b.position)
            .ok_or_else(|| ExchangeError::UnknownMarket(market.symbol.clone()))
    }
}

#[async_trait]
impl Flattenable for PaperExchange {
    async fn close_positions(&self) -> Result<Vec<Order>, ExchangeError> {
        self.pace().await;
        let open: Vec<(Market, f64)> = {
            let mut state = self.lock()?;
            take_failure(&mut state, "close_positions")?;
            state.calls.push("close_positions".to_string());
            state
                .books
                .values()
                .filter(|b| b.position != 0.0)
                .map(|b| (b.market.clone(), b.position))
                .collect()
        };

        let mut closed = Vec::with_capacity(open.len());
        for (market, position) in open {
            let side = if position > 0.0 { Side::Sell } else { Side::Buy };
            closed.push(self.place(&market, side, None, position.abs())?);
        }
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange() -> PaperExchange {
        PaperExchange::new("paper")
            .with_market("ETHBTC", 0.05)
            .with_balance("BTC", 10.0)
    }

    #[test]
    fn test_split_symbol() {
        assert_eq!(
            split_symbol("ETHBTC"),
            Some(("ETH".to_string(), "BTC".to_string()))
        );
        assert_eq!(
            split_symbol("xbt_usd"),
            Some(("XBT".to_string(), "USD".to_string()))
        );
        assert_eq!(
            split_symbol("SOLUSDT"),
            Some(("SOL".to_string(), "USDT".to_string()))
        );
        assert!(split_symbol("BTC").is_none());
    }

    #[tokio::test]
    async fn test_market_resolution() {
        let ex = exchange();
        let market = ex.market("ETHBTC").await.unwrap();
        assert_eq!(market.pair(), "ETH_BTC");
        assert!(ex.market("DOGEUSD").await.is_err());
    }

    #[tokio::test]
    async fn test_market_order_fills_and_moves_position() {
        let ex = exchange();
        let market = ex.market("ETHBTC").await.unwrap();

        ex.bid(&market, None, 2.0).await.unwrap();
        assert_eq!(ex.position_of("ETHBTC"), 2.0);
        assert_eq!(ex.trades(&market).await.unwrap().len(), 1);
        assert!(ex.orders(None).await.unwrap().is_empty());

        ex.ask(&market, None, 3.0).await.unwrap();
        assert!((ex.position_of("ETHBTC") + 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_limit_order_rests_until_cancelled() {
        let ex = exchange();
        let market = ex.market("ETHBTC").await.unwrap();

        ex.bid(&market, Some(0.04), 1.0).await.unwrap();
        ex.ask(&market, Some(0.06), 1.0).await.unwrap();
        assert_eq!(ex.orders(Some(&market)).await.unwrap().len(), 2);
        assert!((ex.balance().await.unwrap()["BTC"].reserved - 0.04).abs() < 1e-9);

        let cancelled = ex.cancel(CancelScope::Market(market.clone())).await.unwrap();
        assert_eq!(cancelled.len(), 2);
        assert!(ex.orders(None).await.unwrap().is_empty());
        assert!((ex.balance().await.unwrap()["BTC"].available - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_insufficient_funds() {
        let ex = exchange();
        let market = ex.market("ETHBTC").await.unwrap();
        let result = ex.bid(&market, None, 1000.0).await;
        assert!(matches!(
            result,
            Err(ExchangeError::InsufficientFunds { .. })
        ));
    }

    #[tokio::test]
    async fn test_synthetic_candles_are_ascending_and_closed() {
        let ex = exchange();
        let market = ex.market("ETHBTC").await.unwrap();
        let candles = ex.candles(&market, None, 100).await.unwrap();

        assert_eq!(candles.len(), 100);
        assert!(candles.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        let last = candles.last().unwrap();
        assert!(last.timestamp + Duration::seconds(60) <= Utc::now());
    }

    #[tokio::test]
    async fn test_close_positions_flattens_everything() {
        let ex = exchange().with_market("XBTUSD", 100.0).with_balance("USD", 1000.0);
        ex.set_position("ETHBTC", 2.0);
        ex.set_position("XBTUSD", -1.5);

        let flattenable = ex.as_flattenable().unwrap();
        let orders = flattenable.close_positions().await.unwrap();

        assert_eq!(orders.len(), 2);
        assert_eq!(ex.position_of("ETHBTC"), 0.0);
        assert_eq!(ex.position_of("XBTUSD"), 0.0);
    }

    #[tokio::test]
    async fn test_capabilities_can_be_disabled() {
        let ex = exchange().without_positions().without_flattening();
        assert!(ex.as_position_aware().is_none());
        assert!(ex.as_flattenable().is_none());
    }

    #[tokio::test]
    async fn test_fail_next_is_one_shot() {
        let ex = exchange();
        ex.fail_next("balance", ExchangeError::Transport("boom".to_string()));
        assert!(ex.balance().await.is_err());
        assert!(ex.balance().await.is_ok());
    }
}
