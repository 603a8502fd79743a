use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use common::{
    Bar, CoverageGap, Direction, InvariantViolation, Position, PriceTick, RejectionReason, Result,
    Signal, TradeEvent,
};
use risk::{PositionManager, RiskState};
use strategy::{
    ConfidenceModel, FeatureExtractor, LogisticModel, SignalScorer, StructureExtractor,
};

use crate::config::EngineConfig;

/// Result of evaluating the newest bar of a symbol.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// Not enough history yet. Not a gap: nothing was attempted.
    Warmup,
    /// Extractor or model failed; this symbol skips this bar.
    Gap(CoverageGap),
    Signal(Signal),
}

/// What to do with a pending entry when a new bar arrives.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingAction {
    Fill,
    /// No trading on this bar; try again on the next one.
    Wait,
    Cancel(RejectionReason),
}

/// Per-symbol state: the rolling bar window and the positions (pending and
/// active) on that symbol. Exactly one writer at a time: replay owns them
/// all, the live driver puts each behind its own mutex.
#[derive(Debug, Clone)]
pub struct SymbolBook {
    symbol: String,
    window: VecDeque<Bar>,
    capacity: usize,
    last_timestamp: Option<DateTime<Utc>>,
    pub positions: Vec<Position>,
}

impl SymbolBook {
    pub fn new(symbol: impl Into<String>, capacity: usize) -> Self {
        Self {
            symbol: symbol.into(),
            window: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            last_timestamp: None,
            positions: Vec::new(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Append a closed bar. Bars must arrive in strictly increasing time.
    pub fn push_bar(&mut self, bar: &Bar) -> Result<(), InvariantViolation> {
        if let Some(previous) = self.last_timestamp {
            if bar.timestamp <= previous {
                return Err(InvariantViolation::OutOfOrderBar {
                    symbol: bar.symbol.clone(),
                    previous,
                    next: bar.timestamp,
                });
            }
        }
        self.last_timestamp = Some(bar.timestamp);
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(bar.clone());
        Ok(())
    }

    pub fn last_bar(&self) -> Option<&Bar> {
        self.window.back()
    }

    /// Bars seen so far, oldest first. Never contains anything newer than
    /// the last pushed bar.
    pub fn window(&mut self) -> &[Bar] {
        self.window.make_contiguous()
    }

    pub fn prune_finished(&mut self) {
        self.positions.retain(|p| !p.is_finished());
    }
}

/// The decision and execution core shared by replay and live trading.
///
/// Holds the extractor, the model, the scorer and the position manager.
/// Drivers differ only in where bars come from and how entry fills are
/// obtained; every decision goes through here.
pub struct DecisionCore {
    extractor: Arc<dyn FeatureExtractor>,
    model: Arc<dyn ConfidenceModel>,
    scorer: SignalScorer,
    manager: PositionManager,
}

impl DecisionCore {
    pub fn new(
        extractor: Arc<dyn FeatureExtractor>,
        model: Arc<dyn ConfidenceModel>,
        config: &EngineConfig,
    ) -> Result<Self> {
        Ok(Self {
            extractor,
            model,
            scorer: SignalScorer::new(config.scorer.clone())?,
            manager: PositionManager::new(config.risk.clone())?,
        })
    }

    /// Core wired to the bundled structure extractor and logistic model.
    pub fn reference(config: &EngineConfig) -> Result<Self> {
        Self::new(
            Arc::new(StructureExtractor::new(config.extractor.clone())),
            Arc::new(LogisticModel::new(config.model.clone())),
            config,
        )
    }

    pub fn manager(&self) -> &PositionManager {
        &self.manager
    }

    /// Bars of history kept per symbol.
    pub fn window_capacity(&self) -> usize {
        self.extractor.warmup().max(1) * 2
    }

    pub fn new_book(&self, symbol: impl Into<String>) -> SymbolBook {
        SymbolBook::new(symbol, self.window_capacity())
    }

    /// Score the newest bar in `book` using only the bars already in it.
    pub fn evaluate(&self, book: &mut SymbolBook) -> Result<Evaluation, InvariantViolation> {
        let warmup = self.extractor.warmup();
        let window = book.window();
        let Some(bar) = window.last() else {
            return Ok(Evaluation::Warmup);
        };
        if window.len() < warmup {
            return Ok(Evaluation::Warmup);
        }
        let (symbol, at) = (bar.symbol.clone(), bar.timestamp);
        let gap = |reason: String| {
            debug!(symbol = %symbol, timestamp = %at, reason = %reason, "Coverage gap");
            Evaluation::Gap(CoverageGap {
                symbol: symbol.clone(),
                timestamp: at,
                reason,
            })
        };

        let features = match self.extractor.extract(window) {
            Ok(f) => f,
            Err(e) => return Ok(gap(e.to_string())),
        };
        if features.timestamp > at {
            return Err(InvariantViolation::Lookahead {
                symbol: symbol.clone(),
                decision_at: at,
                data_at: features.timestamp,
            });
        }
        if features.symbol != symbol {
            return Ok(gap(format!(
                "extractor returned features for '{}'",
                features.symbol
            )));
        }
        let confidence = match self.model.predict(&features) {
            Ok(c) => c,
            Err(e) => return Ok(gap(e.to_string())),
        };

        let signal = self.scorer.score(&features, confidence);
        debug!(
            symbol = %signal.symbol,
            direction = %signal.direction,
            score = signal.score,
            confidence = signal.confidence,
            "Bar scored"
        );
        Ok(Evaluation::Signal(signal))
    }

    /// Decide whether a pending entry fills on `bar`. Counts the bar against
    /// the signal's validity window.
    pub fn pending_action(&self, position: &mut Position, bar: &Bar) -> PendingAction {
        position.bars_pending += 1;
        if position.bars_pending > position.invalidation.valid_bars {
            return PendingAction::Cancel(RejectionReason::Expired);
        }
        let invalidated = match position.direction {
            Direction::Long => bar.open <= position.invalidation.price,
            Direction::Short => bar.open >= position.invalidation.price,
            Direction::Neutral => true,
        };
        if invalidated {
            return PendingAction::Cancel(RejectionReason::Invalidated);
        }
        if bar.volume <= 0.0 {
            return PendingAction::Wait;
        }
        PendingAction::Fill
    }

    /// Apply `bar` to every active position in `book`, in book order.
    pub fn update_positions(
        &self,
        book: &mut SymbolBook,
        bar: &Bar,
        risk: &mut RiskState,
    ) -> Result<Vec<TradeEvent>, InvariantViolation> {
        let tick = PriceTick::from_bar(bar);
        let mut events = Vec::new();
        for position in book.positions.iter_mut().filter(|p| p.is_active()) {
            events.extend(self.manager.on_price_update(position, &tick, risk)?);
        }
        Ok(events)
    }
}
