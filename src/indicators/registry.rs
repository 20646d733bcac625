use super::{calculate_macd, calculate_rsi, calculate_sma, calculate_stoch_rsi};
use crate::error::BotError;
use crate::models::Candle;

/// Scores a candle window: -1 bearish, 0 neutral, +1 bullish
pub type IndicatorFn = fn(&[Candle]) -> i8;

/// An indicator resolved from configuration
#[derive(Debug, Clone, Copy)]
pub struct Indicator {
    pub name: &'static str,
    pub score: IndicatorFn,
}

/// Every indicator a configuration may name
pub const REGISTRY: &[(&str, IndicatorFn)] = &[
    ("macd", macd_score),
    ("rsi", rsi_score),
    ("stoch_rsi", stoch_rsi_score),
    ("sma_cross", sma_cross_score),
];

/// Resolve configured names against [`REGISTRY`]
pub fn resolve_indicators(names: &[String]) -> Result<Vec<Indicator>, BotError> {
    if names.is_empty() {
        return Err(BotError::Config("no indicators configured".to_string()));
    }

    names
        .iter()
        .map(|name| {
            REGISTRY
                .iter()
                .find(|(registered, _)| *registered == name.as_str())
                .map(|(registered, score)| Indicator {
                    name: *registered,
                    score: *score,
                })
                .ok_or_else(|| {
                    let known: Vec<&str> = REGISTRY.iter().map(|(n, _)| *n).collect();
                    BotError::Config(format!(
                        "unknown indicator {:?} (known: {})",
                        name,
                        known.join(", ")
                    ))
                })
        })
        .collect()
}

fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}

/// MACD crossing its signal line below zero (bull) or above zero (bear),
/// confirmed by close against SMA-30
pub fn macd_score(candles: &[Candle]) -> i8 {
    let prices = closes(candles);
    let (Some(close), Some(sma), Some(macd)) = (
        prices.last().copied(),
        calculate_sma(&prices, 30),
        calculate_macd(&prices, 12, 26, 9),
    ) else {
        return 0;
    };

    if close > sma && macd.prev_macd < macd.signal && macd.macd > macd.signal && macd.macd < 0.0 {
        1
    } else if close < sma
        && macd.prev_macd > macd.signal
        && macd.macd < macd.signal
        && macd.macd > 0.0
    {
        -1
    } else {
        0
    }
}

/// Oversold RSI-14 above SMA-30 (bull), overbought below it (bear)
pub fn rsi_score(candles: &[Candle]) -> i8 {
    let prices = closes(candles);
    let (Some(close), Some(sma), Some(rsi)) = (
        prices.last().copied(),
        calculate_sma(&prices, 30),
        calculate_rsi(&prices, 14),
    ) else {
        return 0;
    };

    if close > sma && rsi <= 30.0 {
        1
    } else if close < sma && rsi >= 70.0 {
        -1
    } else {
        0
    }
}

/// Pullback in an uptrend: close above SMA-60, below SMA-10, StochRSI <= 20
pub fn stoch_rsi_score(candles: &[Candle]) -> i8 {
    let prices = closes(candles);
    let (Some(close), Some(sma_10), Some(sma_60), Some(stoch)) = (
        prices.last().copied(),
        calculate_sma(&prices, 10),
        calculate_sma(&prices, 60),
        calculate_stoch_rsi(&prices, 14, 5, 3),
    ) else {
        return 0;
    };

    if close > sma_60 && stoch <= 20.0 && close < sma_10 {
        1
    } else if close < sma_60 && stoch > 80.0 && close > sma_10 {
        -1
    } else {
        0
    }
}

/// SMA-10 crossing SMA-30 relative to the prior bar
pub fn sma_cross_score(candles: &[Candle]) -> i8 {
    let prices = closes(candles);
    if prices.len() < 31 {
        return 0;
    }
    let prior = &prices[..prices.len() - 1];

    let (Some(short), Some(long), Some(prev_short), Some(prev_long)) = (
        calculate_sma(&prices, 10),
        calculate_sma(&prices, 30),
        calculate_sma(prior, 10),
        calculate_sma(prior, 30),
    ) else {
        return 0;
    };

    if prev_short <= prev_long && short > long {
        1
    } else if prev_short >= prev_long && short < long {
        -1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn candles_from(prices: &[f64]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        prices
            .iter()
            .enumerate()
            .map(|(i, &price)| Candle {
                timestamp: start + Duration::minutes(i as i64),
                open: price,
                high: price,
                low: price,
                close: price,
                volume: 100.0,
            })
            .collect()
    }

    #[test]
    fn test_resolve_known_indicators() {
        let names = vec!["macd".to_string(), "sma_cross".to_string()];
        let indicators = resolve_indicators(&names).unwrap();
        assert_eq!(indicators.len(), 2);
        assert_eq!(indicators[0].name, "macd");
        assert_eq!(indicators[1].name, "sma_cross");
    }

    #[test]
    fn test_resolve_unknown_indicator_fails() {
        let names = vec!["bollinger".to_string()];
        let err = resolve_indicators(&names).unwrap_err();
        assert!(err.to_string().contains("bollinger"));
    }

    #[test]
    fn test_resolve_empty_set_fails() {
        assert!(resolve_indicators(&[]).is_err());
    }

    #[test]
    fn test_insufficient_data_is_neutral() {
        let candles = candles_from(&[100.0, 101.0, 102.0]);
        for (_, score) in REGISTRY {
            assert_eq!(score(&candles), 0);
        }
    }

    #[test]
    fn test_flat_market_is_neutral() {
        let candles = candles_from(&[100.0; 100]);
        for (_, score) in REGISTRY {
            assert_eq!(score(&candles), 0);
        }
    }

    #[test]
    fn test_sma_cross_up() {
        let mut prices = vec![100.0; 40];
        prices.push(130.0);
        assert_eq!(sma_cross_score(&candles_from(&prices)), 1);
    }

    #[test]
    fn test_sma_cross_down() {
        let mut prices = vec![100.0; 40];
        prices.push(70.0);
        assert_eq!(sma_cross_score(&candles_from(&prices)), -1);
    }

    #[test]
    fn test_scores_stay_in_range() {
        let prices: Vec<f64> = (0..100)
            .map(|i| 100.0 + (i as f64 * 0.3).sin() * 10.0)
            .collect();
        let candles = candles_from(&prices);
        for (_, score) in REGISTRY {
            assert!((-1..=1).contains(&score(&candles)));
        }
    }
}
