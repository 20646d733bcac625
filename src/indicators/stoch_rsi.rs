use super::rsi::calculate_rsi_series;

/// Stochastic RSI fast-%D
///
/// Fast-%K is where the latest RSI sits within its `k_period` range (0-100),
/// fast-%D is the `d_period` SMA of fast-%K.
pub fn calculate_stoch_rsi(
    prices: &[f64],
    rsi_period: usize,
    k_period: usize,
    d_period: usize,
) -> Option<f64> {
    if k_period == 0 || d_period == 0 {
        return None;
    }

    let rsi = calculate_rsi_series(prices, rsi_period);
    if rsi.len() < k_period + d_period - 1 {
        return None;
    }

    let fast_k: Vec<f64> = rsi
        .windows(k_period)
        .map(|window| {
            let low = window.iter().copied().fold(f64::INFINITY, f64::min);
            let high = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let current = window[window.len() - 1];
            if high > low {
                (current - low) / (high - low) * 100.0
            } else {
                0.0
            }
        })
        .collect();

    let recent = &fast_k[fast_k.len() - d_period..];
    Some(recent.iter().sum::<f64>() / d_period as f64)
}
