use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Portfolio-level risk context for one trading session.
///
/// Owned by whoever drives the position manager and passed into every call,
/// so independent runs never share it. The live driver wraps it in a single
/// mutex; replay owns it outright.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub equity: f64,
    /// Equity when the current session started; base of the daily loss limit.
    pub session_start_equity: f64,
    pub daily_realized_pnl: f64,
    /// Pending plus active positions.
    pub open_positions: usize,
    /// Entries filled this session.
    pub trades_today: usize,
    pub open_by_symbol: BTreeMap<String, usize>,
    pub session: NaiveDate,
    next_position_seq: u64,
}

impl RiskState {
    pub fn new(equity: f64, now: DateTime<Utc>, reset_hour_utc: u32) -> Self {
        Self {
            equity,
            session_start_equity: equity,
            daily_realized_pnl: 0.0,
            open_positions: 0,
            trades_today: 0,
            open_by_symbol: BTreeMap::new(),
            session: session_day(now, reset_hour_utc),
            next_position_seq: 0,
        }
    }

    /// Reset the daily counters if `now` falls in a later session.
    /// Returns true when a reset happened.
    pub fn roll_session(&mut self, now: DateTime<Utc>, reset_hour_utc: u32) -> bool {
        let day = session_day(now, reset_hour_utc);
        if day <= self.session {
            return false;
        }
        info!(
            session = %day,
            previous_pnl = self.daily_realized_pnl,
            trades = self.trades_today,
            "Risk session rolled"
        );
        self.session = day;
        self.session_start_equity = self.equity;
        self.daily_realized_pnl = 0.0;
        self.trades_today = 0;
        true
    }

    /// Loss, in account currency, at which new entries stop.
    pub fn daily_loss_limit(&self, fraction: f64) -> f64 {
        self.session_start_equity * fraction
    }

    pub fn daily_limit_breached(&self, fraction: f64) -> bool {
        self.daily_realized_pnl <= -self.daily_loss_limit(fraction)
    }

    pub fn symbol_open(&self, symbol: &str) -> bool {
        self.open_by_symbol.get(symbol).is_some_and(|n| *n > 0)
    }

    pub(crate) fn reserve(&mut self, symbol: &str) {
        self.open_positions += 1;
        *self.open_by_symbol.entry(symbol.to_string()).or_default() += 1;
    }

    pub(crate) fn release(&mut self, symbol: &str) {
        self.open_positions = self.open_positions.saturating_sub(1);
        if let Some(n) = self.open_by_symbol.get_mut(symbol) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.open_by_symbol.remove(symbol);
            }
        }
    }

    pub(crate) fn realize(&mut self, pnl: f64) {
        self.equity += pnl;
        self.daily_realized_pnl += pnl;
    }

    /// Deterministic id for the next position: same inputs, same ids, so
    /// replayed event streams compare equal.
    pub(crate) fn next_position_id(&mut self, symbol: &str) -> String {
        self.next_position_seq += 1;
        format!("{symbol}-{}", self.next_position_seq)
    }
}

fn session_day(now: DateTime<Utc>, reset_hour_utc: u32) -> NaiveDate {
    (now - Duration::hours(i64::from(reset_hour_utc))).date_naive()
}
