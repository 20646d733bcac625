use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::BotError;
use crate::indicators::resolve_indicators;

pub const DEFAULT_CYCLE_INTERVAL_SECS: u64 = 2;
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;
pub const DEFAULT_CANDLE_WINDOW: usize = 100;

/// Top-level settings file: one table per exchange instance
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub exchanges: BTreeMap<String, ExchangeSettings>,
}

impl Settings {
    /// Load `path`, then overlay `TRADEBOT__...` environment variables
    ///
    /// `TRADEBOT__EXCHANGES__PAPER__KEY=...` overrides `[exchanges.paper] key`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BotError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("TRADEBOT")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize::<Settings>()?;
        Ok(settings.normalized())
    }

    /// Map keys may come back lower-cased from some sources; symbols compare upper-case
    fn normalized(mut self) -> Self {
        for exchange in self.exchanges.values_mut() {
            exchange.params = std::mem::take(&mut exchange.params)
                .into_iter()
                .map(|(symbol, params)| (symbol.to_uppercase(), params))
                .collect();
            exchange.paper.prices = std::mem::take(&mut exchange.paper.prices)
                .into_iter()
                .map(|(symbol, price)| (symbol.to_uppercase(), price))
                .collect();
            exchange.paper.balances = std::mem::take(&mut exchange.paper.balances)
                .into_iter()
                .map(|(currency, amount)| (currency.to_uppercase(), amount))
                .collect();
        }
        self
    }

    /// Settings for one exchange, validated
    pub fn exchange(&self, name: &str) -> Result<&ExchangeSettings, BotError> {
        let settings = self.exchanges.get(name).ok_or_else(|| {
            BotError::Config(format!("no [exchanges.{}] section in configuration", name))
        })?;
        settings.validate()?;
        Ok(settings)
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Signal,
    Quoting,
}

/// One exchange instance: adapter, credentials, markets and strategy
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeSettings {
    /// Adapter to build, e.g. `paper`
    #[serde(default = "default_wrapper")]
    pub wrapper: String,
    pub base_url: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub secret: String,
    pub symbols: Vec<String>,
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default = "default_indicators")]
    pub indicators: Vec<String>,
    /// Per-symbol `[long_cap, short_cap, lot_size, long_threshold, short_threshold, min_volume]`
    #[serde(default)]
    pub params: BTreeMap<String, SignalConfig>,
    #[serde(default)]
    pub session_duration_secs: Option<u64>,
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_candle_window")]
    pub candle_window: usize,
    #[serde(default)]
    pub paper: PaperSettings,
}

fn default_wrapper() -> String {
    "paper".to_string()
}

fn default_indicators() -> Vec<String> {
    vec!["macd".to_string(), "rsi".to_string(), "stoch_rsi".to_string()]
}

fn default_cycle_interval() -> u64 {
    DEFAULT_CYCLE_INTERVAL_SECS
}

fn default_command_timeout() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_candle_window() -> usize {
    DEFAULT_CANDLE_WINDOW
}

impl ExchangeSettings {
    pub fn params_for(&self, symbol: &str) -> Option<&SignalConfig> {
        self.params.get(&symbol.to_uppercase())
    }

    /// Reject configurations the bot must not start with
    pub fn validate(&self) -> Result<(), BotError> {
        if self.symbols.is_empty() {
            return Err(BotError::Config("no symbols configured".to_string()));
        }
        if self.cycle_interval_secs == 0 || self.command_timeout_secs == 0 {
            return Err(BotError::Config(
                "cycle_interval_secs and command_timeout_secs must be positive".to_string(),
            ));
        }
        if self.queue_capacity == 0 || self.candle_window == 0 {
            return Err(BotError::Config(
                "queue_capacity and candle_window must be positive".to_string(),
            ));
        }

        for (symbol, params) in &self.params {
            params
                .validate()
                .map_err(|e| BotError::Config(format!("{}: {}", symbol, e)))?;
            if !self.symbols.iter().any(|s| s.eq_ignore_ascii_case(symbol)) {
                tracing::warn!(symbol = %symbol, "params given for a symbol that is not traded");
            }
        }

        if self.strategy == StrategyKind::Signal {
            resolve_indicators(&self.indicators)?;
            if let Some(missing) = self.symbols.iter().find(|s| self.params_for(s).is_none()) {
                return Err(BotError::Config(format!(
                    "signal strategy needs params for {}",
                    missing
                )));
            }
        }

        Ok(())
    }

    pub fn runtime(&self) -> RuntimeConfig {
        RuntimeConfig {
            cycle_interval: Duration::from_secs(self.cycle_interval_secs),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            queue_capacity: self.queue_capacity,
            session_duration: self.session_duration_secs.map(Duration::from_secs),
            candle_window: self.candle_window,
        }
    }
}

/// Per-market risk parameters, immutable after load
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(from = "[f64; 6]")]
pub struct SignalConfig {
    /// Maximum long position, in counter units
    pub long_cap: f64,
    /// Maximum short position magnitude, in counter units
    pub short_cap: f64,
    /// Maximum quantity added by one order
    pub lot_size: f64,
    pub long_threshold: f64,
    pub short_threshold: f64,
    /// Latest candle volume below this forces every indicator to neutral
    pub min_volume: f64,
}

impl From<[f64; 6]> for SignalConfig {
    fn from(v: [f64; 6]) -> Self {
        Self {
            long_cap: v[0],
            short_cap: v[1],
            lot_size: v[2],
            long_threshold: v[3],
            short_threshold: v[4],
            min_volume: v[5],
        }
    }
}

impl SignalConfig {
    pub fn validate(&self) -> Result<(), String> {
        let values = [
            self.long_cap,
            self.short_cap,
            self.lot_size,
            self.long_threshold,
            self.short_threshold,
            self.min_volume,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err("parameters must be finite".to_string());
        }
        if self.long_threshold <= self.short_threshold {
            return Err(format!(
                "long_threshold {} must be greater than short_threshold {}",
                self.long_threshold, self.short_threshold
            ));
        }
        if self.long_cap < 0.0 || self.short_cap < 0.0 {
            return Err("position caps must not be negative".to_string());
        }
        if self.lot_size <= 0.0 {
            return Err("lot_size must be positive".to_string());
        }
        if self.min_volume < 0.0 {
            return Err("min_volume must not be negative".to_string());
        }
        Ok(())
    }
}

/// Simulation knobs for the `paper` adapter
#[derive(Debug, Clone, Deserialize)]
pub struct PaperSettings {
    #[serde(default)]
    pub prices: BTreeMap<String, f64>,
    #[serde(default)]
    pub balances: BTreeMap<String, f64>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    #[serde(default = "default_true")]
    pub positions: bool,
    #[serde(default = "default_true")]
    pub flattening: bool,
}

impl Default for PaperSettings {
    fn default() -> Self {
        Self {
            prices: BTreeMap::new(),
            balances: BTreeMap::new(),
            seed: default_seed(),
            requests_per_second: default_requests_per_second(),
            positions: true,
            flattening: true,
        }
    }
}

fn default_seed() -> u64 {
    42
}

fn default_requests_per_second() -> u32 {
    20
}

fn default_true() -> bool {
    true
}

/// Control loop timing and sizing
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Sleep between worker cycles
    pub cycle_interval: Duration,
    /// Rolling timeout on command input
    pub command_timeout: Duration,
    pub queue_capacity: usize,
    /// Total session length, unbounded when `None`
    pub session_duration: Option<Duration>,
    pub candle_window: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_secs(DEFAULT_CYCLE_INTERVAL_SECS),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            session_duration: None,
            candle_window: DEFAULT_CANDLE_WINDOW,
        }
    }
}
