use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use common::{
    Direction, ExitReason, InvariantViolation, Position, PositionStatus, PriceTick,
    RejectionReason, Result, Signal, TradeEvent, TradeEventKind,
};

use crate::config::{CollisionPolicy, RiskConfig};
use crate::state::RiskState;

/// Relative tolerance for the size-accounting check. Quantities are `f64`;
/// partial closes are `size * fraction`, so the sum can differ from `size` in
/// the last bits.
const SIZE_TOLERANCE: f64 = 1e-9;

/// The gatekeeper between decisions and positions.
///
/// Owns the position lifecycle rules: `pending -> open -> partially closed* ->
/// closed`. It holds no positions itself; callers own them (one writer per
/// symbol) and pass the portfolio-wide `RiskState` into every call. Every
/// mutation is computed on a copy and committed only after the size and stop
/// invariants check out, so a position is never left half-updated.
#[derive(Debug, Clone)]
pub struct PositionManager {
    config: RiskConfig,
}

impl PositionManager {
    pub fn new(config: RiskConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Position size for `signal` at the current equity:
    /// `equity * risk_fraction / stop_distance`, then clamped to the exchange
    /// notional bounds and the equity cap.
    pub fn position_size(&self, signal: &Signal, equity: f64) -> Result<f64, RejectionReason> {
        let stop_distance = signal.stop_distance();
        if !(stop_distance.is_finite() && stop_distance > 0.0) {
            return Err(RejectionReason::InvalidStopDistance);
        }
        let entry = signal.entry_price;
        if !(entry.is_finite() && entry > 0.0 && equity > 0.0) {
            return Err(RejectionReason::NoTradableSize);
        }

        let mut size = equity * self.config.risk_per_trade_fraction / stop_distance;

        let mut max_notional = self.config.max_notional.unwrap_or(f64::INFINITY);
        if let Some(fraction) = self.config.max_position_fraction {
            max_notional = max_notional.min(equity * fraction);
        }
        if size * entry > max_notional {
            size = max_notional / entry;
        }
        if size * entry < self.config.min_notional {
            size = self.config.min_notional / entry;
        }

        if size.is_finite() && size > 0.0 {
            Ok(size)
        } else {
            Err(RejectionReason::NoTradableSize)
        }
    }

    /// Run the entry risk checks and, if they pass, return a pending
    /// position that holds a slot in `risk`. Nothing is recorded on rejection.
    pub fn try_open(&self, signal: &Signal, risk: &mut RiskState) -> Result<Position, RejectionReason> {
        let outcome = self.check_entry(signal, risk);
        let size = match outcome {
            Ok(size) => size,
            Err(reason) => {
                warn!(
                    symbol = %signal.symbol,
                    direction = %signal.direction,
                    reason = %reason,
                    "Entry rejected by PositionManager"
                );
                return Err(reason);
            }
        };

        let id = risk.next_position_id(&signal.symbol);
        risk.reserve(&signal.symbol);
        info!(
            id = %id,
            symbol = %signal.symbol,
            direction = %signal.direction,
            size = size,
            entry = signal.entry_price,
            stop = signal.stop_loss,
            "Entry approved by PositionManager"
        );

        Ok(Position {
            id,
            symbol: signal.symbol.clone(),
            direction: signal.direction,
            entry_price: signal.entry_price,
            size,
            remaining_size: size,
            closed_size: 0.0,
            stop_price: signal.stop_loss,
            initial_stop: signal.stop_loss,
            risk_distance: signal.stop_distance(),
            take_profits: signal.take_profits.clone(),
            next_take_profit: 0,
            invalidation: signal.invalidation,
            signal_at: signal.timestamp,
            opened_at: None,
            closed_at: None,
            status: PositionStatus::Pending,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            best_price: signal.entry_price,
            bars_pending: 0,
        })
    }

    fn check_entry(&self, signal: &Signal, risk: &RiskState) -> Result<f64, RejectionReason> {
        if signal.direction == Direction::Neutral {
            return Err(RejectionReason::NoDirection);
        }
        if signal.confidence < self.config.min_entry_confidence {
            return Err(RejectionReason::ConfidenceBelowEntryThreshold);
        }
        if risk.daily_limit_breached(self.config.daily_loss_limit_fraction) {
            return Err(RejectionReason::DailyLossLimitExceeded);
        }
        if !self.config.allow_pyramiding && risk.symbol_open(&signal.symbol) {
            return Err(RejectionReason::SymbolAlreadyOpen);
        }
        if risk.open_positions >= self.config.max_concurrent_positions {
            return Err(RejectionReason::MaxConcurrentPositionsExceeded);
        }
        self.position_size(signal, risk.equity)
    }

    /// Record the entry fill of a pending position. The stop and take-profit
    /// prices stay where the signal put them; only the entry moves to the
    /// actual fill.
    pub fn fill_entry(
        &self,
        position: &mut Position,
        price: f64,
        at: DateTime<Utc>,
        risk: &mut RiskState,
    ) -> Result<TradeEvent, InvariantViolation> {
        if !position.is_pending() {
            return Err(illegal(position, "open"));
        }
        position.entry_price = price;
        position.best_price = price;
        position.opened_at = Some(at);
        position.status = PositionStatus::Open;
        risk.trades_today += 1;

        info!(
            id = %position.id,
            symbol = %position.symbol,
            price = price,
            size = position.size,
            "Position opened"
        );

        Ok(event(position, at, TradeEventKind::Opened, price, position.size, 0.0))
    }

    /// Withdraw a pending position (invalidated, expired, or the entry order
    /// failed). Frees its slot; emits nothing because nothing was traded.
    pub fn cancel_pending(
        &self,
        position: &mut Position,
        reason: &RejectionReason,
        risk: &mut RiskState,
    ) -> Result<(), InvariantViolation> {
        if !position.is_pending() {
            return Err(illegal(position, "cancelled"));
        }
        risk.release(&position.symbol);
        position.status = PositionStatus::Cancelled;
        warn!(id = %position.id, symbol = %position.symbol, reason = %reason, "Pending entry cancelled");
        Ok(())
    }

    /// Apply one price observation to an active position.
    ///
    /// Checked in this order: stop hit (closes everything at the stop), then
    /// take-profit levels nearest first, then the trailing-stop ratchet. When
    /// a stop and a take-profit both fall inside `tick`, the collision policy
    /// decides; the default lets the stop win. Pending and closed positions
    /// are left untouched.
    pub fn on_price_update(
        &self,
        position: &mut Position,
        tick: &PriceTick,
        risk: &mut RiskState,
    ) -> Result<Vec<TradeEvent>, InvariantViolation> {
        if !position.is_active() {
            return Ok(Vec::new());
        }

        let mut next = position.clone();
        let mut events = Vec::new();

        match self.config.collision_policy {
            CollisionPolicy::StopFirst => {
                if !self.apply_stop(&mut next, tick, &mut events) {
                    apply_take_profits(&mut next, tick, &mut events);
                }
            }
            CollisionPolicy::TakeProfitFirst => {
                apply_take_profits(&mut next, tick, &mut events);
                if next.is_active() {
                    self.apply_stop(&mut next, tick, &mut events);
                }
            }
        }
        if next.is_active() {
            self.apply_trailing(&mut next, tick, &mut events);
            next.unrealized_pnl = next.pnl_at(tick.last, next.remaining_size);
        }

        self.commit(position, next, risk)?;
        Ok(events)
    }

    /// Close whatever remains at `price`. Always allowed, regardless of risk
    /// state. A pending position is cancelled instead; a finished one is a
    /// no-op.
    pub fn force_close(
        &self,
        position: &mut Position,
        price: f64,
        at: DateTime<Utc>,
        reason: ExitReason,
        risk: &mut RiskState,
    ) -> Result<Option<TradeEvent>, InvariantViolation> {
        if position.is_pending() {
            position.closed_at = Some(at);
            self.cancel_pending(position, &RejectionReason::Expired, risk)?;
            return Ok(None);
        }
        if !position.is_active() {
            return Ok(None);
        }

        let mut next = position.clone();
        let closing = close_remaining(&mut next, price, at, reason);
        self.commit(position, next, risk)?;
        Ok(Some(closing))
    }

    /// Stop check. Returns true if the stop closed the position.
    fn apply_stop(&self, pos: &mut Position, tick: &PriceTick, events: &mut Vec<TradeEvent>) -> bool {
        let (hit, fill) = match pos.direction {
            // A bar that opens through the stop fills at the open.
            Direction::Long => (tick.low <= pos.stop_price, pos.stop_price.min(tick.open)),
            Direction::Short => (tick.high >= pos.stop_price, pos.stop_price.max(tick.open)),
            Direction::Neutral => (false, pos.stop_price),
        };
        if !hit {
            return false;
        }
        let reason = if pos.stop_price != pos.initial_stop {
            ExitReason::TrailingStop
        } else {
            ExitReason::StopLoss
        };
        events.push(close_remaining(pos, fill, tick.timestamp, reason));
        true
    }

    fn apply_trailing(&self, pos: &mut Position, tick: &PriceTick, events: &mut Vec<TradeEvent>) {
        pos.best_price = match pos.direction {
            Direction::Long => pos.best_price.max(tick.high),
            Direction::Short => pos.best_price.min(tick.low),
            Direction::Neutral => pos.best_price,
        };

        let trailing = self.config.trailing;
        if !trailing.enabled || pos.risk_distance <= 0.0 {
            return;
        }
        if pos.favorable_move(pos.best_price) < trailing.activation_r * pos.risk_distance {
            return;
        }

        let candidate =
            pos.best_price - pos.direction.sign() * trailing.distance_r * pos.risk_distance;
        if !pos.improves_stop(candidate) {
            return;
        }
        let from = pos.stop_price;
        pos.stop_price = candidate;
        debug!(id = %pos.id, symbol = %pos.symbol, from = from, to = candidate, "Trailing stop moved");
        events.push(event(
            pos,
            tick.timestamp,
            TradeEventKind::TrailingStopMoved { from },
            candidate,
            pos.remaining_size,
            0.0,
        ));
    }

    /// Check the invariants between `before` and `after`, then write `after`
    /// back and settle realized PnL and slots in `risk`.
    fn commit(
        &self,
        before: &mut Position,
        after: Position,
        risk: &mut RiskState,
    ) -> Result<(), InvariantViolation> {
        check_size_accounting(&after)?;
        if after.remaining_size > before.remaining_size {
            return Err(InvariantViolation::SizeIncreased {
                position_id: after.id.clone(),
                before: before.remaining_size,
                after: after.remaining_size,
            });
        }
        if after.stop_price != before.stop_price && !before.improves_stop(after.stop_price) {
            return Err(InvariantViolation::StopLoosened {
                position_id: after.id.clone(),
                before: before.stop_price,
                after: after.stop_price,
            });
        }

        let realized = after.realized_pnl - before.realized_pnl;
        if realized != 0.0 {
            risk.realize(realized);
        }
        if after.is_closed() {
            risk.release(&after.symbol);
            info!(
                id = %after.id,
                symbol = %after.symbol,
                status = ?after.status,
                realized_pnl = after.realized_pnl,
                "Position closed"
            );
        }
        *before = after;
        Ok(())
    }
}

fn apply_take_profits(pos: &mut Position, tick: &PriceTick, events: &mut Vec<TradeEvent>) {
    while pos.is_active() && pos.next_take_profit < pos.take_profits.len() {
        let index = pos.next_take_profit;
        let level = pos.take_profits[index];
        // A bar that opens past the level fills at the open, never worse than the level.
        let (reached, fill) = match pos.direction {
            Direction::Long => (tick.high >= level.price, level.price.max(tick.open)),
            Direction::Short => (tick.low <= level.price, level.price.min(tick.open)),
            Direction::Neutral => (false, level.price),
        };
        if !reached {
            break;
        }
        pos.next_take_profit += 1;

        let is_last = index + 1 == pos.take_profits.len();
        if is_last {
            events.push(close_remaining(pos, fill, tick.timestamp, ExitReason::TakeProfit));
            break;
        }

        let quantity = (pos.size * level.fraction).min(pos.remaining_size);
        let pnl = pos.pnl_at(fill, quantity);
        pos.remaining_size -= quantity;
        pos.closed_size += quantity;
        pos.realized_pnl += pnl;
        pos.status = PositionStatus::PartiallyClosed;
        events.push(event(
            pos,
            tick.timestamp,
            TradeEventKind::PartialTpFilled { level: index },
            fill,
            quantity,
            pnl,
        ));
    }
}

fn close_remaining(pos: &mut Position, price: f64, at: DateTime<Utc>, reason: ExitReason) -> TradeEvent {
    let quantity = pos.remaining_size;
    let pnl = pos.pnl_at(price, quantity);
    pos.closed_size += quantity;
    pos.remaining_size = 0.0;
    pos.realized_pnl += pnl;
    pos.unrealized_pnl = 0.0;
    pos.status = PositionStatus::Closed(reason);
    pos.closed_at = Some(at);
    event(pos, at, TradeEventKind::Closed { reason }, price, quantity, pnl)
}

fn event(
    pos: &Position,
    at: DateTime<Utc>,
    kind: TradeEventKind,
    price: f64,
    size: f64,
    realized_pnl: f64,
) -> TradeEvent {
    TradeEvent {
        position_id: pos.id.clone(),
        symbol: pos.symbol.clone(),
        timestamp: at,
        direction: pos.direction,
        kind,
        price,
        size,
        realized_pnl,
    }
}

fn check_size_accounting(pos: &Position) -> Result<(), InvariantViolation> {
    let drift = (pos.closed_size + pos.remaining_size - pos.size).abs();
    if drift > SIZE_TOLERANCE * pos.size.max(1.0) || pos.remaining_size < 0.0 {
        return Err(InvariantViolation::SizeLeak {
            position_id: pos.id.clone(),
            size: pos.size,
            closed: pos.closed_size,
            remaining: pos.remaining_size,
        });
    }
    Ok(())
}

fn illegal(position: &Position, to: &'static str) -> InvariantViolation {
    InvariantViolation::IllegalTransition {
        position_id: position.id.clone(),
        from: format!("{:?}", position.status),
        to,
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
