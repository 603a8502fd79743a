use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use common::{
    Bar, EntryTiming, Error, ExitReason, FeatureVector, InvariantViolation, RejectionReason,
    TradeEventKind,
};
use engine::{EngineConfig, ReplayEngine};
use risk::TrailingConfig;
use strategy::{ConfidenceModel, FeatureError, FeatureExtractor};

fn t(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap() + Duration::minutes(minute)
}

fn bar(symbol: &str, minute: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
    Bar {
        symbol: symbol.into(),
        timestamp: t(minute),
        open,
        high,
        low,
        close,
        volume: 100.0,
    }
}

/// Bullish structure on the listed bars only, ATR fixed at 40 so the
/// default 2.5x multiplier gives a stop distance of 100.
struct Scripted {
    long_at: BTreeSet<DateTime<Utc>>,
    fail_at: BTreeSet<DateTime<Utc>>,
    cancel_at: Option<(DateTime<Utc>, Arc<AtomicBool>)>,
}

impl Scripted {
    fn long_at(minutes: &[i64]) -> Self {
        Self {
            long_at: minutes.iter().map(|m| t(*m)).collect(),
            fail_at: BTreeSet::new(),
            cancel_at: None,
        }
    }
}

impl FeatureExtractor for Scripted {
    fn warmup(&self) -> usize {
        1
    }

    fn extract(&self, window: &[Bar]) -> Result<FeatureVector, FeatureError> {
        let bar = window.last().ok_or(FeatureError::InsufficientHistory { needed: 1, got: 0 })?;
        if let Some((at, flag)) = &self.cancel_at {
            if bar.timestamp == *at {
                flag.store(true, Ordering::Relaxed);
            }
        }
        if self.fail_at.contains(&bar.timestamp) {
            return Err(FeatureError::Malformed("scripted failure".into()));
        }
        let mut fv = FeatureVector::new(bar.symbol.clone(), bar.timestamp, bar.close).with_value("atr", 40.0);
        if self.long_at.contains(&bar.timestamp) {
            fv = fv
                .with_flag("bullish_order_block")
                .with_flag("bullish_fvg")
                .with_flag("trend_up")
                .with_flag("htf_trend_up");
        }
        Ok(fv)
    }
}

struct Constant(f64);

impl ConfidenceModel for Constant {
    fn predict(&self, _: &FeatureVector) -> Result<f64, FeatureError> {
        Ok(self.0)
    }
}

fn config(timing: EntryTiming) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.risk.risk_per_trade_fraction = 0.01;
    config.risk.trailing = TrailingConfig { enabled: false, ..TrailingConfig::default() };
    config.replay.entry_timing = timing;
    config
}

fn engine(extractor: Scripted, confidence: f64, config: EngineConfig) -> ReplayEngine {
    ReplayEngine::new(Arc::new(extractor), Arc::new(Constant(confidence)), config, 10_000.0).unwrap()
}

#[test]
fn sized_to_risk_and_walks_the_ladder() {
    let bars = vec![
        bar("BTCUSDT", 0, 19_990.0, 20_010.0, 19_980.0, 20_000.0),
        bar("BTCUSDT", 1, 20_000.0, 20_120.0, 19_950.0, 20_110.0),
        bar("BTCUSDT", 2, 20_110.0, 20_350.0, 20_050.0, 20_320.0),
    ];
    let report = engine(Scripted::long_at(&[0]), 0.9, config(EntryTiming::NextOpen))
        .run(&bars)
        .unwrap();

    let kinds: Vec<_> = report.events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            TradeEventKind::Opened,
            TradeEventKind::PartialTpFilled { level: 0 },
            TradeEventKind::PartialTpFilled { level: 1 },
            TradeEventKind::Closed { reason: ExitReason::TakeProfit },
        ]
    );
    // 10_000 * 0.01 / 100
    assert_eq!(report.events[0].size, 1.0);
    assert_eq!(report.events[0].price, 20_000.0);
    assert_eq!(report.events[0].timestamp, t(1));
    let prices: Vec<f64> = report.events[1..].iter().map(|e| e.price).collect();
    assert_eq!(prices, vec![20_100.0, 20_200.0, 20_300.0]);
    assert_eq!(report.summary.total_trades, 1);
    assert!(report.open_positions.is_empty());
}

#[test]
fn stop_wins_when_bar_spans_stop_and_target() {
    let bars = vec![
        bar("BTCUSDT", 0, 19_990.0, 20_010.0, 19_980.0, 20_000.0),
        bar("BTCUSDT", 1, 20_000.0, 20_150.0, 19_850.0, 20_000.0),
    ];
    let report = engine(Scripted::long_at(&[0]), 0.9, config(EntryTiming::NextOpen))
        .run(&bars)
        .unwrap();

    let kinds: Vec<_> = report.events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            TradeEventKind::Opened,
            TradeEventKind::Closed { reason: ExitReason::StopLoss },
        ]
    );
    assert_eq!(report.events[1].price, 19_900.0);
    assert_eq!(report.final_risk.equity, 9_900.0);
}

#[test]
fn entry_gapping_above_the_first_target_takes_it_at_the_open() {
    let bars = vec![
        bar("BTCUSDT", 0, 19_990.0, 20_010.0, 19_980.0, 20_000.0),
        bar("BTCUSDT", 1, 20_150.0, 20_180.0, 20_140.0, 20_160.0),
    ];
    let mut cfg = config(EntryTiming::NextOpen);
    cfg.replay.close_at_end = false;
    let report = engine(Scripted::long_at(&[0]), 0.9, cfg).run(&bars).unwrap();

    let kinds: Vec<_> = report.events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![TradeEventKind::Opened, TradeEventKind::PartialTpFilled { level: 0 }]
    );
    assert_eq!(report.events[0].price, 20_150.0);
    // Target 20_100 was never offered; the bar's first trade was 20_150.
    assert_eq!(report.events[1].price, 20_150.0);
    assert_eq!(report.events[1].size, 0.5);
    assert!(report.events[1].realized_pnl >= 0.0);
    assert_eq!(report.final_risk.equity, 10_000.0);
}

#[test]
fn low_confidence_never_reaches_the_position_manager() {
    let bars = vec![
        bar("BTCUSDT", 0, 19_990.0, 20_010.0, 19_980.0, 20_000.0),
        bar("BTCUSDT", 1, 20_000.0, 20_150.0, 19_950.0, 20_100.0),
    ];
    let report = engine(Scripted::long_at(&[0, 1]), 0.4, config(EntryTiming::NextOpen))
        .run(&bars)
        .unwrap();

    assert!(report.signals.iter().all(|s| !s.is_actionable()));
    assert!(report.events.is_empty());
    assert!(report.rejections.is_empty());
}

#[test]
fn signal_close_timing_fills_on_the_signal_bar() {
    let bars = vec![
        bar("BTCUSDT", 0, 19_990.0, 20_010.0, 19_980.0, 20_000.0),
        bar("BTCUSDT", 1, 20_000.0, 20_050.0, 19_950.0, 20_020.0),
    ];
    let mut cfg = config(EntryTiming::SignalClose);
    cfg.replay.close_at_end = false;
    let report = engine(Scripted::long_at(&[0]), 0.9, cfg).run(&bars).unwrap();

    assert_eq!(report.events.len(), 1);
    assert_eq!(report.events[0].timestamp, t(0));
    assert_eq!(report.events[0].price, 20_000.0);
    assert_eq!(report.open_positions.len(), 1);
}

#[test]
fn gap_down_through_invalidation_cancels_the_entry() {
    let bars = vec![
        bar("BTCUSDT", 0, 19_990.0, 20_010.0, 19_980.0, 20_000.0),
        bar("BTCUSDT", 1, 19_850.0, 19_900.0, 19_800.0, 19_880.0),
    ];
    let report = engine(Scripted::long_at(&[0]), 0.9, config(EntryTiming::NextOpen))
        .run(&bars)
        .unwrap();

    assert!(report.events.is_empty());
    assert_eq!(report.rejections.len(), 1);
    assert_eq!(report.rejections[0].reason, RejectionReason::Invalidated);
    assert_eq!(report.final_risk.open_positions, 0);
}

#[test]
fn session_end_closes_what_is_left() {
    let bars = vec![
        bar("BTCUSDT", 0, 19_990.0, 20_010.0, 19_980.0, 20_000.0),
        bar("BTCUSDT", 1, 20_000.0, 20_050.0, 19_950.0, 20_040.0),
    ];
    let report = engine(Scripted::long_at(&[0]), 0.9, config(EntryTiming::NextOpen))
        .run(&bars)
        .unwrap();

    let last = report.events.last().unwrap();
    assert_eq!(last.kind, TradeEventKind::Closed { reason: ExitReason::SessionEnd });
    assert_eq!(last.price, 20_040.0);
    assert!(report.open_positions.is_empty());
    assert_eq!(report.final_risk.open_positions, 0);
}

#[test]
fn extractor_failures_are_gaps_not_aborts() {
    let bars: Vec<Bar> = (0..5)
        .map(|i| bar("BTCUSDT", i, 100.0, 101.0, 99.0, 100.5))
        .collect();
    let mut extractor = Scripted::long_at(&[]);
    extractor.fail_at = [t(1), t(3)].into_iter().collect();
    let report = engine(extractor, 0.9, config(EntryTiming::NextOpen)).run(&bars).unwrap();

    assert_eq!(report.bars_processed, 5);
    assert_eq!(report.gaps.len(), 2);
    assert_eq!(report.gaps[0].timestamp, t(1));
    assert_eq!(report.signals.len(), 3);
    assert!(report.summary.incomplete_coverage);
    assert_eq!(report.summary.coverage_gaps, 2);
}

#[test]
fn daily_loss_limit_blocks_every_symbol_until_next_session() {
    let mut cfg = config(EntryTiming::NextOpen);
    cfg.risk.daily_loss_limit_fraction = 0.01;
    let day = 24 * 60;
    let bars = vec![
        bar("AAAUSDT", 0, 19_990.0, 20_010.0, 19_980.0, 20_000.0),
        bar("AAAUSDT", 1, 20_000.0, 20_010.0, 19_800.0, 19_850.0),
        bar("BBBUSDT", 2, 19_990.0, 20_010.0, 19_980.0, 20_000.0),
        bar("AAAUSDT", 3, 19_850.0, 19_900.0, 19_800.0, 19_880.0),
        bar("BBBUSDT", day, 19_990.0, 20_010.0, 19_980.0, 20_000.0),
        bar("BBBUSDT", day + 1, 20_000.0, 20_020.0, 19_990.0, 20_010.0),
    ];
    let extractor = Scripted::long_at(&[0, 2, 3, day]);
    let report = engine(extractor, 0.9, cfg).run(&bars).unwrap();

    let blocked: Vec<_> = report
        .rejections
        .iter()
        .filter(|r| r.reason == RejectionReason::DailyLossLimitExceeded)
        .map(|r| (r.symbol.as_str(), r.timestamp))
        .collect();
    assert_eq!(blocked, vec![("BBBUSDT", t(2)), ("AAAUSDT", t(3))]);
    assert!(report
        .events
        .iter()
        .any(|e| e.symbol == "BBBUSDT" && e.kind == TradeEventKind::Opened && e.timestamp == t(day + 1)));
}

#[test]
fn same_input_same_report() {
    let bars: Vec<Bar> = (0..30)
        .map(|i| {
            let base = 20_000.0 + (i as f64 * 0.7).sin() * 150.0;
            bar("BTCUSDT", i, base, base + 60.0, base - 60.0, base + 20.0)
        })
        .collect();
    let longs: Vec<i64> = (0..30).filter(|i| i % 4 == 0).collect();
    let a = engine(Scripted::long_at(&longs), 0.9, config(EntryTiming::NextOpen)).run(&bars).unwrap();

    // Independent runs share nothing and can sit on other threads.
    let parallel: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let replay = engine(Scripted::long_at(&longs), 0.9, config(EntryTiming::NextOpen));
                let bars = &bars;
                s.spawn(move || replay.run(bars).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    for b in parallel {
        assert_eq!(a, b);
    }
    assert!(!a.events.is_empty());
}

#[test]
fn cancellation_stops_between_bars() {
    let bars: Vec<Bar> = (0..10)
        .map(|i| bar("BTCUSDT", i, 100.0, 101.0, 99.0, 100.5))
        .collect();
    let flag = Arc::new(AtomicBool::new(false));
    let mut extractor = Scripted::long_at(&[]);
    // Trips the flag while evaluating bar 3.
    extractor.cancel_at = Some((t(3), flag.clone()));

    let report = engine(extractor, 0.9, config(EntryTiming::NextOpen))
        .with_cancel_flag(flag)
        .run(&bars)
        .unwrap();

    assert!(report.aborted);
    assert_eq!(report.bars_processed, 4);
    assert_eq!(report.signals.len(), 4);
}

#[test]
fn out_of_order_bars_halt_the_run() {
    let bars = vec![
        bar("BTCUSDT", 1, 100.0, 101.0, 99.0, 100.5),
        bar("BTCUSDT", 0, 100.0, 101.0, 99.0, 100.5),
    ];
    let err = engine(Scripted::long_at(&[]), 0.9, config(EntryTiming::NextOpen))
        .run(&bars)
        .unwrap_err();
    assert!(matches!(err, Error::Invariant(InvariantViolation::OutOfOrderBar { .. })));
}

struct FromTheFuture;

impl FeatureExtractor for FromTheFuture {
    fn warmup(&self) -> usize {
        1
    }

    fn extract(&self, window: &[Bar]) -> Result<FeatureVector, FeatureError> {
        let bar = window.last().ok_or(FeatureError::InsufficientHistory { needed: 1, got: 0 })?;
        Ok(FeatureVector::new(bar.symbol.clone(), bar.timestamp + Duration::minutes(1), bar.close))
    }
}

#[test]
fn lookahead_halts_the_run() {
    let bars = vec![bar("BTCUSDT", 0, 100.0, 101.0, 99.0, 100.5)];
    let engine = ReplayEngine::new(
        Arc::new(FromTheFuture),
        Arc::new(Constant(0.9)),
        EngineConfig::default(),
        10_000.0,
    )
    .unwrap();
    assert!(matches!(
        engine.run(&bars),
        Err(Error::Invariant(InvariantViolation::Lookahead { .. }))
    ));
}
