use super::moving_average::calculate_ema_series;

/// Latest MACD reading together with the previous bar's MACD value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdPoint {
    pub macd: f64,
    pub signal: f64,
    pub prev_macd: f64,
}

/// Moving Average Convergence Divergence
///
/// MACD line = EMA(fast) - EMA(slow), signal line = EMA(signal) of the MACD line.
pub fn calculate_macd(
    prices: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> Option<MacdPoint> {
    if fast == 0 || fast >= slow || signal == 0 {
        return None;
    }

    let fast_ema = calculate_ema_series(prices, fast);
    let slow_ema = calculate_ema_series(prices, slow);
    if slow_ema.is_empty() {
        return None;
    }

    // fast_ema starts at index fast-1, slow_ema at slow-1
    let offset = slow - fast;
    let macd_line: Vec<f64> = slow_ema
        .iter()
        .enumerate()
        .map(|(i, slow_value)| fast_ema[i + offset] - slow_value)
        .collect();

    if macd_line.len() < 2 {
        return None;
    }

    let signal_line = calculate_ema_series(&macd_line, signal);
    let signal_value = *signal_line.last()?;
    let macd = macd_line[macd_line.len() - 1];

    Some(MacdPoint {
        macd,
        signal: signal_value,
        prev_macd: macd_line[macd_line.len() - 2],
    })
}
