use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One OHLCV record for a symbol at a fixed timeframe.
/// Immutable once emitted; ordered by `timestamp` per symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    /// Bar close time. Everything in the bar is known at this instant.
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Range of the bar, `high - low`.
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}

/// Indicator read-out for one symbol at one bar.
///
/// `values` holds named numeric indicators (e.g. `"atr"`, `"rsi"`); `flags`
/// holds the structural flags that are present on this bar
/// (e.g. `"bullish_fvg"`, `"htf_trend_down"`). Absent flags are simply not in
/// the set. Both collections are ordered so iteration is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub symbol: String,
    /// Timestamp of the newest bar the extractor looked at.
    pub timestamp: DateTime<Utc>,
    /// Close of the newest bar.
    pub close: f64,
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
    #[serde(default)]
    pub flags: BTreeSet<String>,
}

impl FeatureVector {
    pub fn new(symbol: impl Into<String>, timestamp: DateTime<Utc>, close: f64) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            close,
            values: BTreeMap::new(),
            flags: BTreeSet::new(),
        }
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn has_flag(&self, name: &str) -> bool {
        self.flags.contains(name)
    }

    pub fn with_value(mut self, name: impl Into<String>, value: f64) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn with_flag(mut self, name: impl Into<String>) -> Self {
        self.flags.insert(name.into());
        self
    }
}

/// Trade direction of a signal or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    /// No actionable decision. Never reaches the position manager.
    Neutral,
}

impl Direction {
    /// +1 for long, -1 for short, 0 for neutral.
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
            Direction::Neutral => 0.0,
        }
    }

    /// Side of the order that opens a position in this direction.
    pub fn entry_side(&self) -> Option<OrderSide> {
        match self {
            Direction::Long => Some(OrderSide::Buy),
            Direction::Short => Some(OrderSide::Sell),
            Direction::Neutral => None,
        }
    }

    /// Side of the order that reduces a position in this direction.
    pub fn exit_side(&self) -> Option<OrderSide> {
        match self {
            Direction::Long => Some(OrderSide::Sell),
            Direction::Short => Some(OrderSide::Buy),
            Direction::Neutral => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "long"),
            Direction::Short => write!(f, "short"),
            Direction::Neutral => write!(f, "none"),
        }
    }
}

/// Coarse quality grade of a signal, derived from its composite score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalGrade {
    Weak,
    Moderate,
    Strong,
}

/// One rung of a take-profit ladder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitLevel {
    pub price: f64,
    /// Fraction of the original size closed at this level.
    pub fraction: f64,
}

/// Condition under which a not-yet-filled signal is void.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Invalidation {
    /// Entry is void if the fill bar opens at or beyond this price.
    pub price: f64,
    /// Entry is void if it has not filled within this many bars.
    pub valid_bars: u32,
}

/// Decision produced by the signal scorer. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    /// Model confidence in `[0, 1]`.
    pub confidence: f64,
    /// Composite of structure and confidence in `[0, 1]` for `direction`.
    pub score: f64,
    pub grade: SignalGrade,
    pub entry_price: f64,
    pub stop_loss: f64,
    /// Nearest first.
    pub take_profits: Vec<TakeProfitLevel>,
    pub invalidation: Invalidation,
    /// Final take-profit distance over stop distance.
    pub risk_reward: f64,
    /// Flags that contributed to the chosen direction, in config order.
    pub reasons: Vec<String>,
}

impl Signal {
    pub fn is_actionable(&self) -> bool {
        self.direction != Direction::Neutral
    }

    pub fn stop_distance(&self) -> f64 {
        (self.entry_price - self.stop_loss).abs()
    }
}

/// Lifecycle state of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum PositionStatus {
    /// Passed risk checks; entry order not yet filled.
    Pending,
    Open,
    PartiallyClosed,
    Closed(ExitReason),
    /// Withdrawn before the entry filled. Never traded.
    Cancelled,
}

/// Why a position (or its remainder) was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    TakeProfit,
    Manual,
    SessionEnd,
    Emergency,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "stop-loss"),
            ExitReason::TrailingStop => write!(f, "trailing-stop"),
            ExitReason::TakeProfit => write!(f, "take-profit"),
            ExitReason::Manual => write!(f, "manual"),
            ExitReason::SessionEnd => write!(f, "session-end"),
            ExitReason::Emergency => write!(f, "emergency"),
        }
    }
}

/// A position owned by the position manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    /// Requested entry while pending, actual fill price once open.
    pub entry_price: f64,
    pub size: f64,
    pub remaining_size: f64,
    /// Sum of every partial and final close so far.
    pub closed_size: f64,
    pub stop_price: f64,
    /// Stop placed by the signal. A close at any other stop level is a trailing exit.
    pub initial_stop: f64,
    /// Distance between entry and the original stop; defines 1R.
    pub risk_distance: f64,
    pub take_profits: Vec<TakeProfitLevel>,
    /// Index of the next unfilled take-profit level.
    pub next_take_profit: usize,
    pub invalidation: Invalidation,
    pub signal_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub status: PositionStatus,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    /// Most favorable price seen since entry.
    pub best_price: f64,
    /// Bars seen while pending.
    pub bars_pending: u32,
}

impl Position {
    /// Open or partially closed.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            PositionStatus::Open | PositionStatus::PartiallyClosed
        )
    }

    pub fn is_pending(&self) -> bool {
        self.status == PositionStatus::Pending
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.status, PositionStatus::Closed(_))
    }

    /// Closed or cancelled: nothing left to manage.
    pub fn is_finished(&self) -> bool {
        matches!(self.status, PositionStatus::Closed(_) | PositionStatus::Cancelled)
    }

    /// PnL of closing `quantity` at `price`.
    pub fn pnl_at(&self, price: f64, quantity: f64) -> f64 {
        self.direction.sign() * (price - self.entry_price) * quantity
    }

    /// Price excursion in the position's favor, in price units.
    pub fn favorable_move(&self, price: f64) -> f64 {
        self.direction.sign() * (price - self.entry_price)
    }

    /// True if `candidate` is a tighter (better for the position) stop than the current one.
    pub fn improves_stop(&self, candidate: f64) -> bool {
        match self.direction {
            Direction::Long => candidate > self.stop_price,
            Direction::Short => candidate < self.stop_price,
            Direction::Neutral => false,
        }
    }
}

/// Price observation fed to `on_price_update`.
///
/// From a bar, `high`/`low` are the intrabar extremes and `open` is where
/// trading resumed, which is the price a resting order crossed by a gap
/// fills at. From a live trade print, all four prices are equal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub last: f64,
}

impl PriceTick {
    pub fn at(timestamp: DateTime<Utc>, price: f64) -> Self {
        Self {
            timestamp,
            open: price,
            high: price,
            low: price,
            last: price,
        }
    }

    pub fn from_bar(bar: &Bar) -> Self {
        Self {
            timestamp: bar.timestamp,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            last: bar.close,
        }
    }
}

/// Kind of state transition recorded in a [`TradeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TradeEventKind {
    Opened,
    /// `level` is the zero-based index into the take-profit ladder.
    PartialTpFilled { level: usize },
    /// `price` on the event is the new stop; `from` is the previous one.
    TrailingStopMoved { from: f64 },
    Closed { reason: ExitReason },
}

/// Append-only record of a position state transition. Canonical output of
/// both replay and live runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub position_id: String,
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub kind: TradeEventKind,
    pub price: f64,
    /// Quantity filled by this event. For trailing moves, the size the new stop protects.
    pub size: f64,
    /// PnL realized by this event alone.
    pub realized_pnl: f64,
}

impl TradeEvent {
    pub fn reason(&self) -> String {
        match self.kind {
            TradeEventKind::Opened => "opened".to_string(),
            TradeEventKind::PartialTpFilled { level } => format!("partial-tp-{}", level + 1),
            TradeEventKind::TrailingStopMoved { .. } => "trailing-stop-moved".to_string(),
            TradeEventKind::Closed { reason } => reason.to_string(),
        }
    }

    pub fn is_close(&self) -> bool {
        matches!(self.kind, TradeEventKind::Closed { .. })
    }
}

/// Side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// An order to be submitted to the exchange by the live driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    /// `None` = market order; `Some(price)` = limit order.
    pub price: Option<f64>,
    /// Position this order opens or reduces.
    pub position_id: String,
}

impl Order {
    pub fn market(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: f64,
        position_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            quantity,
            price: None,
            position_id: position_id.into(),
        }
    }
}

/// Confirmation of a filled order returned by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub fill_price: f64,
    pub quantity: f64,
    pub timestamp: DateTime<Utc>,
}

/// Whether the process replays history or trades a live feed on paper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Replay,
    Paper,
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Replay => write!(f, "replay"),
            TradingMode::Paper => write!(f, "paper"),
        }
    }
}

/// Reason a signal did not become a position. An ordinary outcome, not a fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    DailyLossLimitExceeded,
    MaxConcurrentPositionsExceeded,
    SymbolAlreadyOpen,
    ConfidenceBelowEntryThreshold,
    /// Neutral signals are informational and never actionable.
    NoDirection,
    InvalidStopDistance,
    /// Equity or stop distance leaves no positive size to trade.
    NoTradableSize,
    /// Fill bar opened beyond the signal's invalidation price.
    Invalidated,
    /// Pending entry did not fill within the signal's validity window.
    Expired,
    /// Entry order was not filled by the exchange.
    OrderFailed(String),
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::DailyLossLimitExceeded => write!(f, "daily loss limit exceeded"),
            RejectionReason::MaxConcurrentPositionsExceeded => {
                write!(f, "max concurrent positions exceeded")
            }
            RejectionReason::SymbolAlreadyOpen => write!(f, "symbol already open"),
            RejectionReason::ConfidenceBelowEntryThreshold => {
                write!(f, "confidence below entry threshold")
            }
            RejectionReason::NoDirection => write!(f, "signal has no direction"),
            RejectionReason::InvalidStopDistance => write!(f, "invalid stop distance"),
            RejectionReason::NoTradableSize => write!(f, "no tradable size"),
            RejectionReason::Invalidated => write!(f, "signal invalidated before fill"),
            RejectionReason::Expired => write!(f, "entry not filled within validity window"),
            RejectionReason::OrderFailed(e) => write!(f, "entry order failed: {e}"),
        }
    }
}

/// A rejection recorded by a run, for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub reason: RejectionReason,
}

/// A bar for which no decision could be made (extractor or model failure).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageGap {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn position(direction: Direction, entry: f64, stop: f64) -> Position {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Position {
            id: "p".into(),
            symbol: "BTCUSDT".into(),
            direction,
            entry_price: entry,
            size: 1.0,
            remaining_size: 1.0,
            closed_size: 0.0,
            stop_price: stop,
            initial_stop: stop,
            risk_distance: (entry - stop).abs(),
            take_profits: Vec::new(),
            next_take_profit: 0,
            invalidation: Invalidation { price: stop, valid_bars: 1 },
            signal_at: t,
            opened_at: Some(t),
            closed_at: None,
            status: PositionStatus::Open,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            best_price: entry,
            bars_pending: 0,
        }
    }

    #[test]
    fn pnl_sign_follows_direction() {
        let long = position(Direction::Long, 100.0, 90.0);
        let short = position(Direction::Short, 100.0, 110.0);
        assert_eq!(long.pnl_at(110.0, 2.0), 20.0);
        assert_eq!(short.pnl_at(110.0, 2.0), -20.0);
    }

    #[test]
    fn stop_improvement_is_directional() {
        let long = position(Direction::Long, 100.0, 90.0);
        assert!(long.improves_stop(95.0));
        assert!(!long.improves_stop(85.0));

        let short = position(Direction::Short, 100.0, 110.0);
        assert!(short.improves_stop(105.0));
        assert!(!short.improves_stop(115.0));
    }

    #[test]
    fn event_reason_names_transition() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let event = TradeEvent {
            position_id: "p".into(),
            symbol: "ETHUSDT".into(),
            timestamp: t,
            direction: Direction::Long,
            kind: TradeEventKind::PartialTpFilled { level: 0 },
            price: 1.0,
            size: 1.0,
            realized_pnl: 0.0,
        };
        assert_eq!(event.reason(), "partial-tp-1");
        assert!(!event.is_close());
    }

    #[test]
    fn neutral_direction_has_no_order_side() {
        assert_eq!(Direction::Neutral.entry_side(), None);
        assert_eq!(Direction::Short.entry_side(), Some(OrderSide::Sell));
        assert_eq!(Direction::Short.exit_side(), Some(OrderSide::Buy));
    }
}
