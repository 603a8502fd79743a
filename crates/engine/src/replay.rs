use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use common::{
    Bar, CoverageGap, EntryTiming, Error, ExitReason, FillModel, InvariantViolation, Position,
    Rejection, RejectionReason, Result, Signal, TradeEvent,
};
use paper::BarFillModel;
use risk::RiskState;
use strategy::{ConfidenceModel, FeatureExtractor, LogisticModel, StructureExtractor};

use crate::config::EngineConfig;
use crate::metrics::PerformanceSummary;
use crate::pipeline::{DecisionCore, Evaluation, PendingAction, SymbolBook};

/// Everything a replay produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub events: Vec<TradeEvent>,
    /// Every scored bar, actionable or not, in timeline order.
    pub signals: Vec<Signal>,
    pub rejections: Vec<Rejection>,
    pub gaps: Vec<CoverageGap>,
    pub summary: PerformanceSummary,
    /// Positions still pending or open when the run stopped.
    pub open_positions: Vec<Position>,
    pub final_risk: RiskState,
    pub bars_processed: usize,
    /// The run was cancelled before the last bar.
    pub aborted: bool,
}

/// Drives the decision core bar by bar over historical data.
///
/// Single-threaded and deterministic: the same bars and config always give
/// the same report. Each engine owns its own risk state and positions, so
/// independent engines can run on separate threads.
pub struct ReplayEngine {
    core: DecisionCore,
    fill: Box<dyn FillModel>,
    config: EngineConfig,
    initial_equity: f64,
    cancel: Arc<AtomicBool>,
}

impl ReplayEngine {
    pub fn new(
        extractor: Arc<dyn FeatureExtractor>,
        model: Arc<dyn ConfidenceModel>,
        config: EngineConfig,
        initial_equity: f64,
    ) -> Result<Self> {
        config.validate()?;
        if !(initial_equity > 0.0 && initial_equity.is_finite()) {
            return Err(Error::Config(format!("initial equity must be positive, got {initial_equity}")));
        }
        let core = DecisionCore::new(extractor, model, &config)?;
        let fill = BarFillModel::new(config.replay.entry_timing, config.replay.slippage_bps);
        Ok(Self {
            core,
            fill: Box::new(fill),
            config,
            initial_equity,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Engine wired to the bundled structure extractor and logistic model.
    pub fn reference(config: EngineConfig, initial_equity: f64) -> Result<Self> {
        Self::new(
            Arc::new(StructureExtractor::new(config.extractor.clone())),
            Arc::new(LogisticModel::new(config.model.clone())),
            config,
            initial_equity,
        )
    }

    /// Replace the simulated execution model.
    pub fn with_fill_model(mut self, fill: Box<dyn FillModel>) -> Self {
        self.fill = fill;
        self
    }

    /// Share a cancellation flag, e.g. one flag for a batch of parallel runs.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Flag that stops the run before the next bar when set.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn run(&self, bars: &[Bar]) -> Result<ReplayReport> {
        let timeline = timeline(bars)?;
        let first = timeline
            .first()
            .map(|b| b.timestamp)
            .ok_or_else(|| Error::Other("no bars to replay".into()))?;
        info!(
            bars = timeline.len(),
            symbols = symbol_count(&timeline),
            equity = self.initial_equity,
            "Replay started"
        );

        let mut run = Run {
            core: &self.core,
            fill: self.fill.as_ref(),
            reset_hour: self.config.risk.session_reset_hour_utc,
            risk: RiskState::new(self.initial_equity, first, self.config.risk.session_reset_hour_utc),
            books: BTreeMap::new(),
            events: Vec::new(),
            signals: Vec::new(),
            rejections: Vec::new(),
            gaps: Vec::new(),
        };

        let mut processed = 0;
        let mut aborted = false;
        for bar in &timeline {
            if self.cancel.load(Ordering::Relaxed) {
                warn!(processed, "Replay cancelled");
                aborted = true;
                break;
            }
            if let Err(violation) = run.step(bar) {
                error!(symbol = %bar.symbol, timestamp = %bar.timestamp, error = %violation, "Replay halted");
                return Err(violation.into());
            }
            processed += 1;
        }

        if !aborted {
            run.finish(self.config.replay.close_at_end)?;
        }

        let summary =
            PerformanceSummary::from_events(&run.events, self.initial_equity, run.gaps.len());
        info!(
            trades = summary.total_trades,
            final_equity = summary.final_equity,
            gaps = run.gaps.len(),
            aborted,
            "Replay finished"
        );

        let open_positions = run
            .books
            .into_values()
            .flat_map(|b| b.positions)
            .filter(|p| !p.is_finished())
            .collect();

        Ok(ReplayReport {
            events: run.events,
            signals: run.signals,
            rejections: run.rejections,
            gaps: run.gaps,
            summary,
            open_positions,
            final_risk: run.risk,
            bars_processed: processed,
            aborted,
        })
    }
}

/// Replay with the given collaborators in one call.
pub fn run(
    bars: &[Bar],
    extractor: Arc<dyn FeatureExtractor>,
    model: Arc<dyn ConfidenceModel>,
    config: EngineConfig,
    initial_equity: f64,
) -> Result<ReplayReport> {
    ReplayEngine::new(extractor, model, config, initial_equity)?.run(bars)
}

/// Mutable state of one replay.
struct Run<'a> {
    core: &'a DecisionCore,
    fill: &'a dyn FillModel,
    reset_hour: u32,
    risk: RiskState,
    books: BTreeMap<String, SymbolBook>,
    events: Vec<TradeEvent>,
    signals: Vec<Signal>,
    rejections: Vec<Rejection>,
    gaps: Vec<CoverageGap>,
}

impl Run<'_> {
    /// One bar of one symbol: settle pending entries at the open, run the
    /// bar's range against open positions, then decide on the close.
    fn step(&mut self, bar: &Bar) -> Result<(), InvariantViolation> {
        self.risk.roll_session(bar.timestamp, self.reset_hour);

        let core = self.core;
        let book = self
            .books
            .entry(bar.symbol.clone())
            .or_insert_with(|| core.new_book(bar.symbol.clone()));
        book.push_bar(bar)?;

        for position in book.positions.iter_mut().filter(|p| p.is_pending()) {
            match core.pending_action(position, bar) {
                PendingAction::Fill => {
                    let price = self.fill.entry_price(position.direction, bar);
                    let event = core.manager().fill_entry(position, price, bar.timestamp, &mut self.risk)?;
                    self.events.push(event);
                }
                PendingAction::Wait => {}
                PendingAction::Cancel(reason) => {
                    core.manager().cancel_pending(position, &reason, &mut self.risk)?;
                    self.rejections.push(Rejection {
                        symbol: bar.symbol.clone(),
                        timestamp: bar.timestamp,
                        reason,
                    });
                }
            }
        }

        let events = core.update_positions(book, bar, &mut self.risk)?;
        self.events.extend(events);
        book.prune_finished();

        match core.evaluate(book)? {
            Evaluation::Warmup => {}
            Evaluation::Gap(gap) => self.gaps.push(gap),
            Evaluation::Signal(signal) => {
                if signal.is_actionable() {
                    match core.manager().try_open(&signal, &mut self.risk) {
                        Ok(mut position) => {
                            if self.fill.timing() == EntryTiming::SignalClose {
                                let price = self.fill.entry_price(position.direction, bar);
                                let event = core
                                    .manager()
                                    .fill_entry(&mut position, price, bar.timestamp, &mut self.risk)?;
                                self.events.push(event);
                            }
                            book.positions.push(position);
                        }
                        Err(reason) => self.rejections.push(Rejection {
                            symbol: signal.symbol.clone(),
                            timestamp: signal.timestamp,
                            reason,
                        }),
                    }
                }
                self.signals.push(signal);
            }
        }
        Ok(())
    }

    /// End of data: cancel pending entries and, if asked, close what is
    /// still open at each symbol's last close.
    fn finish(&mut self, close_at_end: bool) -> Result<(), InvariantViolation> {
        let core = self.core;
        let manager = core.manager();
        for book in self.books.values_mut() {
            let Some(last) = book.last_bar().cloned() else {
                continue;
            };
            for position in book.positions.iter_mut() {
                if position.is_pending() {
                    manager.cancel_pending(position, &RejectionReason::Expired, &mut self.risk)?;
                    self.rejections.push(Rejection {
                        symbol: last.symbol.clone(),
                        timestamp: last.timestamp,
                        reason: RejectionReason::Expired,
                    });
                } else if close_at_end {
                    if let Some(event) = manager.force_close(
                        position,
                        last.close,
                        last.timestamp,
                        ExitReason::SessionEnd,
                        &mut self.risk,
                    )? {
                        self.events.push(event);
                    }
                }
            }
            book.prune_finished();
        }
        Ok(())
    }
}

/// All bars merged into one timeline ordered by (timestamp, symbol).
/// Each symbol's bars must already be in strictly increasing time.
fn timeline(bars: &[Bar]) -> Result<Vec<&Bar>, InvariantViolation> {
    let mut last: BTreeMap<&str, &Bar> = BTreeMap::new();
    for bar in bars {
        if let Some(previous) = last.insert(&bar.symbol, bar) {
            if bar.timestamp <= previous.timestamp {
                return Err(InvariantViolation::OutOfOrderBar {
                    symbol: bar.symbol.clone(),
                    previous: previous.timestamp,
                    next: bar.timestamp,
                });
            }
        }
    }
    let mut merged: Vec<&Bar> = bars.iter().collect();
    merged.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    Ok(merged)
}

fn symbol_count(timeline: &[&Bar]) -> usize {
    let mut symbols: Vec<&str> = timeline.iter().map(|b| b.symbol.as_str()).collect();
    symbols.sort_unstable();
    symbols.dedup();
    symbols.len()
}
