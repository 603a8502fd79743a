/// Full EMA series over `data`, seeded with the SMA of the first `period`
/// values. Element `i` of the result corresponds to `data[period - 1 + i]`.
pub fn ema_series(data: &[f64], period: usize) -> Option<Vec<f64>> {
    if period == 0 || data.len() < period {
        return None;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let seed = data[..period].iter().sum::<f64>() / period as f64;

    let mut out = Vec::with_capacity(data.len() - period + 1);
    out.push(seed);
    let mut value = seed;
    for &x in &data[period..] {
        value = x * k + value * (1.0 - k);
        out.push(value);
    }
    Some(out)
}

/// Latest EMA value over `data`.
pub fn ema(data: &[f64], period: usize) -> Option<f64> {
    ema_series(data, period).and_then(|s| s.last().copied())
}
