//! Performance metrics: pure functions over a `TradeEvent` stream.
//!
//! Replay and live runs produce the same event shape, so the same numbers
//! come out of both.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::{Direction, ExitReason, TradeEvent, TradeEventKind};

/// One fully closed position, folded from its events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub position_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_reason: ExitReason,
    /// Sum of every partial and final close.
    pub net_pnl: f64,
}

impl TradeOutcome {
    pub fn is_winner(&self) -> bool {
        self.net_pnl > 0.0
    }

    pub fn duration_secs(&self) -> f64 {
        (self.closed_at - self.opened_at).num_milliseconds() as f64 / 1_000.0
    }
}

/// Aggregate statistics for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub total_return: f64,
    pub initial_equity: f64,
    pub final_equity: f64,
    /// Largest peak-to-trough fall of realized equity, as a negative fraction.
    pub max_drawdown: f64,
    /// Mean over standard deviation of per-trade returns. Not annualized.
    pub sharpe: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub expectancy: f64,
    pub avg_duration_secs: f64,
    pub coverage_gaps: usize,
    /// Some bars could not be evaluated; the numbers above cover less than
    /// the full data set.
    pub incomplete_coverage: bool,
}

impl PerformanceSummary {
    pub fn from_events(events: &[TradeEvent], initial_equity: f64, coverage_gaps: usize) -> Self {
        let trades = trades_from_events(events);
        let curve = equity_curve(events, initial_equity);
        let final_equity = curve.last().copied().unwrap_or(initial_equity);
        let returns: Vec<f64> = if initial_equity > 0.0 {
            trades.iter().map(|t| t.net_pnl / initial_equity).collect()
        } else {
            Vec::new()
        };

        let wins: Vec<f64> = trades.iter().filter(|t| t.is_winner()).map(|t| t.net_pnl).collect();
        let losses: Vec<f64> = trades.iter().filter(|t| t.net_pnl < 0.0).map(|t| t.net_pnl).collect();

        Self {
            total_trades: trades.len(),
            wins: wins.len(),
            losses: losses.len(),
            win_rate: win_rate(&trades),
            profit_factor: profit_factor(&trades),
            total_return: total_return(&curve),
            initial_equity,
            final_equity,
            max_drawdown: max_drawdown(&curve),
            sharpe: sharpe_ratio(&returns),
            avg_win: mean_f64(&wins),
            avg_loss: mean_f64(&losses),
            expectancy: mean_f64(&trades.iter().map(|t| t.net_pnl).collect::<Vec<_>>()),
            avg_duration_secs: mean_f64(&trades.iter().map(|t| t.duration_secs()).collect::<Vec<_>>()),
            coverage_gaps,
            incomplete_coverage: coverage_gaps > 0,
        }
    }
}

// ─── Individual metric functions ──────────────────────────────────────────────

/// Fold events into closed trades, in close order. Positions still open at
/// the end of the stream are not trades yet and are left out.
pub fn trades_from_events(events: &[TradeEvent]) -> Vec<TradeOutcome> {
    let mut open: BTreeMap<&str, (DateTime<Utc>, f64, f64)> = BTreeMap::new();
    let mut trades = Vec::new();

    for event in events {
        match event.kind {
            TradeEventKind::Opened => {
                open.insert(&event.position_id, (event.timestamp, event.price, 0.0));
            }
            TradeEventKind::PartialTpFilled { .. } => {
                if let Some(entry) = open.get_mut(event.position_id.as_str()) {
                    entry.2 += event.realized_pnl;
                }
            }
            TradeEventKind::TrailingStopMoved { .. } => {}
            TradeEventKind::Closed { reason } => {
                if let Some((opened_at, entry_price, partials)) = open.remove(event.position_id.as_str()) {
                    trades.push(TradeOutcome {
                        position_id: event.position_id.clone(),
                        symbol: event.symbol.clone(),
                        direction: event.direction,
                        opened_at,
                        closed_at: event.timestamp,
                        entry_price,
                        exit_reason: reason,
                        net_pnl: partials + event.realized_pnl,
                    });
                }
            }
        }
    }
    trades
}

/// Realized equity after each event that realized PnL, starting at `initial`.
pub fn equity_curve(events: &[TradeEvent], initial: f64) -> Vec<f64> {
    let mut equity = initial;
    let mut curve = vec![initial];
    for event in events.iter().filter(|e| e.realized_pnl != 0.0) {
        equity += event.realized_pnl;
        curve.push(equity);
    }
    curve
}

/// Total return as a fraction: (final - initial) / initial.
pub fn total_return(equity_curve: &[f64]) -> f64 {
    match (equity_curve.first(), equity_curve.last()) {
        (Some(&initial), Some(&last)) if initial > 0.0 => (last - initial) / initial,
        _ => 0.0,
    }
}

/// Maximum drawdown as a negative fraction (e.g., -0.15 = 15% drawdown).
pub fn max_drawdown(equity_curve: &[f64]) -> f64 {
    let Some(&first) = equity_curve.first() else {
        return 0.0;
    };
    let mut peak = first;
    let mut max_dd = 0.0_f64;
    for &eq in equity_curve {
        if eq > peak {
            peak = eq;
        }
        if peak > 0.0 {
            max_dd = max_dd.min((eq - peak) / peak);
        }
    }
    max_dd
}

pub fn win_rate(trades: &[TradeOutcome]) -> f64 {
    if trades.is_empty() {
        return 0.0;
    }
    trades.iter().filter(|t| t.is_winner()).count() as f64 / trades.len() as f64
}

/// Gross profit over gross loss, capped at 100.0 when nothing was lost.
pub fn profit_factor(trades: &[TradeOutcome]) -> f64 {
    let gross_profit: f64 = trades.iter().filter(|t| t.net_pnl > 0.0).map(|t| t.net_pnl).sum();
    let gross_loss: f64 = trades.iter().filter(|t| t.net_pnl < 0.0).map(|t| -t.net_pnl).sum();
    if gross_loss < 1e-10 {
        return if gross_profit > 0.0 { 100.0 } else { 0.0 };
    }
    (gross_profit / gross_loss).min(100.0)
}

/// Mean over sample standard deviation. Zero with fewer than two returns or
/// no variance.
pub fn sharpe_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let std = std_dev(returns);
    if std < 1e-15 {
        return 0.0;
    }
    mean_f64(returns) / std
}

fn mean_f64(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64]) -> f64 {
    let mean = mean_f64(values);
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}
