// Technical indicators module
// SMA/EMA, RSI, MACD and StochRSI plus the named scoring rules built on them

pub mod macd;
pub mod moving_average;
pub mod registry;
pub mod rsi;
pub mod stoch_rsi;

pub use macd::{calculate_macd, MacdPoint};
pub use moving_average::{calculate_ema, calculate_ema_series, calculate_sma};
pub use registry::{resolve_indicators, Indicator, IndicatorFn, REGISTRY};
pub use rsi::{calculate_rsi, calculate_rsi_series};
pub use stoch_rsi::calculate_stoch_rsi;
