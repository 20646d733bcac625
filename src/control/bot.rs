use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::commands::{read_commands, Command};
use super::reporter::{ReportKind, Reporter};
use super::shutdown::{ShutdownHandle, ShutdownReason};
use crate::config::RuntimeConfig;
use crate::exchange::{CancelScope, Exchange, ExchangeError};
use crate::models::{Market, Order};
use crate::strategy::Strategy;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotState {
    Starting,
    Running,
    Draining,
    Stopped,
}

#[derive(Serialize)]
struct StatusReport<'a> {
    strategy: &'a str,
    markets: &'a BTreeMap<String, bool>,
}

/// Control loop for one exchange session
///
/// A reader task feeds commands through a bounded queue; the worker (this
/// struct) applies at most one per cycle, runs the strategy over enabled
/// markets, reports, then sleeps. Shutdown is observed at the top of a cycle.
pub struct TradingBot {
    exchange: Arc<dyn Exchange>,
    strategy: Box<dyn Strategy>,
    reporter: Reporter,
    shutdown: ShutdownHandle,
    runtime: RuntimeConfig,
    symbols: Vec<String>,
    markets: Vec<Market>,
    /// Keyed by pair id, touched only by the worker
    enabled: BTreeMap<String, bool>,
    state: BotState,
}

impl TradingBot {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        strategy: Box<dyn Strategy>,
        reporter: Reporter,
        shutdown: ShutdownHandle,
        runtime: RuntimeConfig,
        symbols: Vec<String>,
    ) -> Self {
        Self {
            exchange,
            strategy,
            reporter,
            shutdown,
            runtime,
            symbols,
            markets: Vec::new(),
            enabled: BTreeMap::new(),
            state: BotState::Starting,
        }
    }

    pub fn state(&self) -> BotState {
        self.state
    }

    pub fn markets(&self) -> &[Market] {
        &self.markets
    }

    pub fn enabled(&self) -> &BTreeMap<String, bool> {
        &self.enabled
    }

    /// Resolve every configured symbol; all markets start enabled
    pub async fn start(&mut self) -> Result<()> {
        for symbol in &self.symbols {
            let market = self.exchange.market(symbol).await?;
            tracing::info!(
                market = %market.pair(),
                increment = market.increment,
                "market resolved"
            );
            self.enabled.insert(market.pair(), true);
            self.markets.push(market);
        }
        self.state = BotState::Running;
        tracing::info!(
            exchange = self.exchange.name(),
            strategy = self.strategy.name(),
            markets = self.markets.len(),
            "🚀 trading session started"
        );
        Ok(())
    }

    /// Run the session to completion
    ///
    /// Returns the shutdown reason after a managed shutdown. Errors from the
    /// strategy pass end the session early and are returned after all open
    /// orders have been cancelled. The reader task is joined either way.
    pub async fn run<R>(&mut self, input: R) -> Result<ShutdownReason>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        if let Err(err) = self.start().await {
            tracing::error!(error = %err, "startup failed");
            self.reporter.error(&err.to_string());
            self.state = BotState::Stopped;
            return Err(err);
        }

        let (tx, rx) = mpsc::channel(self.runtime.queue_capacity);
        let reader = tokio::spawn(read_commands(
            input,
            tx,
            self.reporter.clone(),
            self.shutdown.clone(),
            self.runtime.command_timeout,
        ));

        let outcome = self.work(rx).await;
        if outcome.is_err() {
            self.shutdown.trigger(ShutdownReason::Failed);
        }
        reader.await?;

        outcome
    }

    async fn work(&mut self, mut commands: mpsc::Receiver<Command>) -> Result<ShutdownReason> {
        let deadline = self.runtime.session_duration.map(|d| Instant::now() + d);

        loop {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                self.shutdown.trigger(ShutdownReason::SessionElapsed);
            }
            if let Some(reason) = self.shutdown.reason() {
                self.drain(reason).await;
                return Ok(reason);
            }

            if let Err(err) = self.cycle(&mut commands).await {
                self.fail(&err.to_string()).await;
                return Err(err);
            }

            tokio::select! {
                biased;
                _ = self.shutdown.wait() => {}
                _ = tokio::time::sleep(self.runtime.cycle_interval) => {}
            }
        }
    }

    async fn cycle(&mut self, commands: &mut mpsc::Receiver<Command>) -> Result<()> {
        if let Ok(command) = commands.try_recv() {
            self.apply(command).await?;
        }

        let placed = self.trade_enabled().await?;
        if !placed.is_empty() {
            self.reporter.report(ReportKind::NewOrders, &placed);
        }

        self.report().await;
        Ok(())
    }

    /// Apply one queued command
    pub async fn apply(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Markets(toggles) => {
                for (pair, toggle) in toggles {
                    let Some(market) = self.markets.iter().find(|m| m.pair() == pair).cloned()
                    else {
                        tracing::warn!(market = %pair, "toggle for unknown market ignored");
                        self.reporter.error(&format!("unknown market {}", pair));
                        continue;
                    };

                    self.enabled.insert(pair.clone(), toggle.is_on());
                    tracing::info!(market = %pair, on = toggle.is_on(), "market toggled");

                    if !toggle.is_on() {
                        let cancelled = self.exchange.cancel(CancelScope::Market(market)).await?;
                        tracing::debug!(market = %pair, cancelled = cancelled.len(), "orders cancelled");
                    }
                }
            }
            Command::Pause => {
                for on in self.enabled.values_mut() {
                    *on = false;
                }
                let cancelled = self.exchange.cancel(CancelScope::All).await?;
                tracing::info!(cancelled = cancelled.len(), "⏸️ all markets paused");
            }
            // The reader answers these before queueing; only direct callers reach here
            Command::Ping(data) => self.reporter.report(ReportKind::Pong, &data),
            Command::Shutdown => {
                self.shutdown.trigger(ShutdownReason::Requested);
            }
        }
        Ok(())
    }

    async fn trade_enabled(&mut self) -> Result<Vec<Order>> {
        let mut placed = Vec::new();
        for market in &self.markets {
            if !self.enabled.get(&market.pair()).copied().unwrap_or(false) {
                continue;
            }
            placed.extend(self.strategy.trade(market).await?);
        }
        Ok(placed)
    }

    /// Emit every report; each one fails on its own
    async fn report(&self) {
        let exchange = self.exchange.as_ref();

        match exchange.balance().await {
            Ok(balances) => self.reporter.report(ReportKind::Balance, &balances),
            Err(e) => self.report_failure("balance", &e),
        }

        match exchange.orders(None).await {
            Ok(orders) => self.reporter.report(ReportKind::ActiveOrders, &orders),
            Err(e) => self.report_failure("active orders", &e),
        }

        self.reporter.report(
            ReportKind::Status,
            &StatusReport {
                strategy: self.strategy.name(),
                markets: &self.enabled,
            },
        );

        let mut books = BTreeMap::new();
        for market in &self.markets {
            match exchange.order_book(market).await {
                Ok(book) => {
                    books.insert(market.pair(), book);
                }
                Err(e) => self.report_failure(&format!("order book {}", market.pair()), &e),
            }
        }
        self.reporter.report(ReportKind::Orderbooks, &books);

        let mut trades = BTreeMap::new();
        for market in &self.markets {
            match exchange.trades(market).await {
                Ok(history) => {
                    trades.insert(market.pair(), history);
                }
                Err(e) => self.report_failure(&format!("trades {}", market.pair()), &e),
            }
        }
        self.reporter.report(ReportKind::Trades, &trades);

        if let Some(positions_api) = exchange.as_position_aware() {
            let mut positions = BTreeMap::new();
            for market in &self.markets {
                match positions_api.position(market).await {
                    Ok(position) => {
                        positions.insert(market.pair(), position);
                    }
                    Err(e) => self.report_failure(&format!("position {}", market.pair()), &e),
                }
            }
            self.reporter.report(ReportKind::Positions, &positions);
        }

        let signals: BTreeMap<String, BTreeMap<String, i8>> = self
            .markets
            .iter()
            .filter_map(|m| self.strategy.signals(m).map(|s| (m.pair(), s)))
            .collect();
        if !signals.is_empty() {
            self.reporter.report(ReportKind::Signals, &signals);
        }
    }

    fn report_failure(&self, what: &str, err: &ExchangeError) {
        tracing::warn!(report = what, error = %err, "report fetch failed");
        self.reporter.error(&format!("{} unavailable: {}", what, err));
    }

    /// Fatal path: report, cancel everything, no flattening
    async fn fail(&mut self, message: &str) {
        tracing::error!(error = message, "❌ strategy cycle failed");
        self.reporter.error(message);

        if let Err(e) = self.exchange.cancel(CancelScope::All).await {
            tracing::error!(error = %e, "cancel all failed");
            self.reporter.error(&format!("cancel all failed: {}", e));
        }
        self.state = BotState::Stopped;
    }

    /// Managed shutdown: cancel all, flatten if supported, final empty order list
    async fn drain(&mut self, reason: ShutdownReason) {
        self.state = BotState::Draining;
        tracing::info!(%reason, "draining session");

        match self.exchange.cancel(CancelScope::All).await {
            Ok(cancelled) => tracing::info!(cancelled = cancelled.len(), "open orders cancelled"),
            Err(e) => self.report_failure("cancel all", &e),
        }

        if let Some(flattenable) = self.exchange.as_flattenable() {
            match flattenable.close_positions().await {
                Ok(closed) => tracing::info!(closed = closed.len(), "positions flattened"),
                Err(e) => self.report_failure("close positions", &e),
            }
        }

        self.reporter.report(ReportKind::ActiveOrders, &Vec::<Order>::new());
        self.state = BotState::Stopped;
        tracing::info!(%reason, "✅ session stopped");
    }
}
