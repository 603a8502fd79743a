/// Wilder-smoothed RSI of the newest close, in `[0, 100]`.
///
/// The seed averages are simple means over the first `period` moves; every
/// later move is blended in with weight `1 / period`. `None` below
/// `period + 1` closes.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period < 2 || closes.len() <= period {
        return None;
    }

    let split = |d: f64| (d.max(0.0), (-d).max(0.0));
    let mut moves = closes.windows(2).map(|w| split(w[1] - w[0]));

    let n = period as f64;
    let (up, down) = moves
        .by_ref()
        .take(period)
        .fold((0.0, 0.0), |(u, d), (g, l)| (u + g, d + l));
    let (up, down) = moves.fold((up / n, down / n), |(u, d), (g, l)| {
        ((u * (n - 1.0) + g) / n, (d * (n - 1.0) + l) / n)
    });

    if down == 0.0 {
        return Some(if up == 0.0 { 50.0 } else { 100.0 });
    }
    Some(100.0 - 100.0 / (1.0 + up / down))
}
