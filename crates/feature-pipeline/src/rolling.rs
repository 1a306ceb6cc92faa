//! Rolling-window primitives over per-country series.
//!
//! Every function returns a vector the same length as its input; slots
//! without enough history hold NaN. The engineer replaces NaN with zero in
//! the final pass, so the marker never reaches a serialized row.

/// Value shifted back by `k` rows.
pub fn lag(data: &[f64], k: usize) -> Vec<f64> {
    (0..data.len())
        .map(|i| if i >= k { data[i - k] } else { f64::NAN })
        .collect()
}

/// First difference.
pub fn diff(data: &[f64]) -> Vec<f64> {
    (0..data.len())
        .map(|i| if i >= 1 { data[i] - data[i - 1] } else { f64::NAN })
        .collect()
}

/// `change / max(|previous|, eps)`.
pub fn pct_change(data: &[f64], eps: f64) -> Vec<f64> {
    (0..data.len())
        .map(|i| {
            if i >= 1 {
                (data[i] - data[i - 1]) / data[i - 1].abs().max(eps)
            } else {
                f64::NAN
            }
        })
        .collect()
}

/// Trailing mean over a full window of `w` values (current row included).
pub fn rolling_mean(data: &[f64], w: usize) -> Vec<f64> {
    (0..data.len())
        .map(|i| {
            if w == 0 || i + 1 < w {
                f64::NAN
            } else {
                let window = &data[i + 1 - w..=i];
                window.iter().sum::<f64>() / w as f64
            }
        })
        .collect()
}

/// Trailing sample standard deviation over a full window of `w` values.
pub fn rolling_std(data: &[f64], w: usize) -> Vec<f64> {
    (0..data.len())
        .map(|i| {
            if w < 2 || i + 1 < w {
                f64::NAN
            } else {
                let window = &data[i + 1 - w..=i];
                let mean = window.iter().sum::<f64>() / w as f64;
                let var = window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (w - 1) as f64;
                var.sqrt()
            }
        })
        .collect()
}

/// Trailing z-score of the current value against its `w`-window; zero when
/// the window is flat.
pub fn rolling_zscore(data: &[f64], w: usize) -> Vec<f64> {
    let means = rolling_mean(data, w);
    let stds = rolling_std(data, w);
    (0..data.len())
        .map(|i| {
            if means[i].is_nan() || stds[i].is_nan() {
                f64::NAN
            } else if stds[i] == 0.0 {
                0.0
            } else {
                (data[i] - means[i]) / stds[i]
            }
        })
        .collect()
}

/// Wilder RSI. The gain/loss averages are seeded by the simple mean of the
/// first `period` moves, then updated with the EMA recurrence
/// `avg = (avg * (period - 1) + move) / period`. A zero average loss pins
/// the oscillator at 100.
pub fn wilder_rsi(prices: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; prices.len()];
    if period == 0 || prices.len() < period + 1 {
        return out;
    }

    let mut gains = Vec::with_capacity(prices.len() - 1);
    let mut losses = Vec::with_capacity(prices.len() - 1);
    for i in 1..prices.len() {
        let change = prices[i] - prices[i - 1];
        gains.push(change.max(0.0));
        losses.push((-change).max(0.0));
    }

    let mut avg_gain = gains[..period].iter().sum::<f64>() / period as f64;
    let mut avg_loss = losses[..period].iter().sum::<f64>() / period as f64;
    out[period] = rsi_value(avg_gain, avg_loss);

    for i in period..gains.len() {
        avg_gain = (avg_gain * (period - 1) as f64 + gains[i]) / period as f64;
        avg_loss = (avg_loss * (period - 1) as f64 + losses[i]) / period as f64;
        out[i + 1] = rsi_value(avg_gain, avg_loss);
    }

    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}
