use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use common::{
    Bar, CoverageGap, EntryTiming, Error, ExchangeClient, ExitReason, InvariantViolation, Order,
    Position, Rejection, RejectionReason, Result, Signal, TradeEvent, TradeEventKind,
};
use risk::RiskState;

use crate::config::EngineConfig;
use crate::pipeline::{DecisionCore, Evaluation, PendingAction, SymbolBook};

/// What one bar did to one symbol.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BarReport {
    pub events: Vec<TradeEvent>,
    pub rejections: Vec<Rejection>,
    pub gap: Option<CoverageGap>,
    pub signal: Option<Signal>,
}

/// Feeds a live bar stream through the same decision core replay uses and
/// turns its decisions into exchange orders.
///
/// One book per symbol, each behind its own mutex, so a symbol's positions
/// have exactly one writer at a time while different symbols proceed
/// concurrently. The portfolio risk state sits behind a single mutex; it is
/// always taken after a book lock and never held across an exchange call.
pub struct LiveDriver {
    core: DecisionCore,
    client: Arc<dyn ExchangeClient>,
    books: BTreeMap<String, Arc<Mutex<SymbolBook>>>,
    risk: Arc<Mutex<RiskState>>,
    events_tx: broadcast::Sender<TradeEvent>,
    entry_timing: EntryTiming,
    reset_hour: u32,
    cancel: Arc<AtomicBool>,
}

impl LiveDriver {
    pub fn new(
        core: DecisionCore,
        client: Arc<dyn ExchangeClient>,
        symbols: &[String],
        config: &EngineConfig,
        initial_equity: f64,
        now: DateTime<Utc>,
    ) -> Self {
        let books = symbols
            .iter()
            .map(|s| (s.clone(), Arc::new(Mutex::new(core.new_book(s.clone())))))
            .collect();
        let (events_tx, _) = broadcast::channel(1024);
        let reset_hour = config.risk.session_reset_hour_utc;
        info!(symbols = ?symbols, equity = initial_equity, "LiveDriver initialized");
        Self {
            core,
            client,
            books,
            risk: Arc::new(Mutex::new(RiskState::new(initial_equity, now, reset_hour))),
            events_tx,
            entry_timing: config.replay.entry_timing,
            reset_hour,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to the trade event broadcast.
    pub fn subscribe(&self) -> broadcast::Receiver<TradeEvent> {
        self.events_tx.subscribe()
    }

    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub async fn risk_snapshot(&self) -> RiskState {
        self.risk.lock().await.clone()
    }

    /// Pending and active positions across all symbols.
    pub async fn positions(&self) -> Vec<Position> {
        let mut all = Vec::new();
        for book in self.books.values() {
            all.extend(book.lock().await.positions.iter().cloned());
        }
        all
    }

    /// Process one closed bar. Same order as replay: pending entries at the
    /// open, the bar's range against open positions, then a decision on the
    /// close.
    pub async fn on_bar(&self, bar: &Bar) -> Result<BarReport> {
        let book = self.books.get(&bar.symbol).ok_or_else(|| {
            Error::Other(format!("LiveDriver is not tracking symbol '{}'", bar.symbol))
        })?;
        let mut book = book.lock().await;
        let mut report = BarReport::default();

        self.risk.lock().await.roll_session(bar.timestamp, self.reset_hour);
        book.push_bar(bar).map_err(|v| self.fatal(v))?;

        self.client.on_market_price(&bar.symbol, bar.open, bar.timestamp).await?;
        for position in book.positions.iter_mut().filter(|p| p.is_pending()) {
            match self.core.pending_action(position, bar) {
                PendingAction::Fill => self.submit_entry(position, &mut report).await?,
                PendingAction::Wait => {}
                PendingAction::Cancel(reason) => {
                    let mut risk = self.risk.lock().await;
                    self.core
                        .manager()
                        .cancel_pending(position, &reason, &mut risk)
                        .map_err(|v| self.fatal(v))?;
                    report.rejections.push(Rejection {
                        symbol: bar.symbol.clone(),
                        timestamp: bar.timestamp,
                        reason,
                    });
                }
            }
        }

        self.client.on_market_price(&bar.symbol, bar.close, bar.timestamp).await?;
        let exits = {
            let mut risk = self.risk.lock().await;
            self.core
                .update_positions(&mut book, bar, &mut risk)
                .map_err(|v| self.fatal(v))?
        };
        for event in &exits {
            self.submit_exit(event).await;
        }
        report.events.extend(exits);
        book.prune_finished();

        match self.core.evaluate(&mut book).map_err(|v| self.fatal(v))? {
            Evaluation::Warmup => {}
            Evaluation::Gap(gap) => {
                warn!(symbol = %gap.symbol, reason = %gap.reason, "No decision for bar");
                report.gap = Some(gap);
            }
            Evaluation::Signal(signal) => {
                if signal.is_actionable() {
                    let opened = {
                        let mut risk = self.risk.lock().await;
                        self.core.manager().try_open(&signal, &mut risk)
                    };
                    match opened {
                        Ok(mut position) => {
                            if self.entry_timing == EntryTiming::SignalClose {
                                self.submit_entry(&mut position, &mut report).await?;
                            }
                            if !position.is_finished() {
                                book.positions.push(position);
                            }
                        }
                        Err(reason) => report.rejections.push(Rejection {
                            symbol: signal.symbol.clone(),
                            timestamp: signal.timestamp,
                            reason,
                        }),
                    }
                }
                report.signal = Some(signal);
            }
        }

        for event in &report.events {
            // No subscribers is fine.
            let _ = self.events_tx.send(event.clone());
        }
        Ok(report)
    }

    /// Close everything at the latest known price. Pending entries are
    /// withdrawn. Always permitted.
    pub async fn force_close_all(&self, reason: ExitReason) -> Result<Vec<TradeEvent>> {
        let mut events = Vec::new();
        for (symbol, book) in &self.books {
            let mut book = book.lock().await;
            let Some(last) = book.last_bar().cloned() else {
                continue;
            };
            let price = self.client.current_price(symbol).await.unwrap_or(last.close);
            for position in book.positions.iter_mut() {
                let closed = {
                    let mut risk = self.risk.lock().await;
                    self.core
                        .manager()
                        .force_close(position, price, last.timestamp, reason, &mut risk)
                        .map_err(|v| self.fatal(v))?
                };
                if let Some(event) = closed {
                    self.submit_exit(&event).await;
                    let _ = self.events_tx.send(event.clone());
                    events.push(event);
                }
            }
            book.prune_finished();
        }
        info!(closed = events.len(), reason = %reason, "All positions force-closed");
        Ok(events)
    }

    /// Consume a bar feed until it ends or the driver is cancelled. Each
    /// symbol gets its own task; bars of one symbol are processed in order.
    pub async fn run(self: Arc<Self>, mut feed: mpsc::Receiver<Bar>) -> Result<()> {
        let mut lanes: HashMap<String, mpsc::Sender<Bar>> = HashMap::new();
        let mut tasks = JoinSet::new();

        for symbol in self.books.keys() {
            let (tx, mut rx) = mpsc::channel::<Bar>(256);
            lanes.insert(symbol.clone(), tx);
            let driver = self.clone();
            tasks.spawn(async move {
                while let Some(bar) = rx.recv().await {
                    if driver.cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    if let Err(e) = driver.on_bar(&bar).await {
                        driver.cancel.store(true, Ordering::Relaxed);
                        return Err(e);
                    }
                }
                Ok(())
            });
        }

        info!(symbols = lanes.len(), "LiveDriver running");
        while let Some(bar) = feed.recv().await {
            if self.cancel.load(Ordering::Relaxed) {
                warn!("LiveDriver cancelled, feed no longer consumed");
                break;
            }
            match lanes.get(&bar.symbol) {
                Some(lane) => {
                    if lane.send(bar).await.is_err() {
                        break;
                    }
                }
                None => debug!(symbol = %bar.symbol, "Bar for untracked symbol ignored"),
            }
        }
        drop(lanes);

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(Error::Other(format!("symbol task failed: {e}"))),
            }
        }
        info!("LiveDriver feed finished");
        Ok(())
    }

    /// Submit the entry order for a pending position. A failed order cancels
    /// the position; nothing is recorded as opened.
    async fn submit_entry(&self, position: &mut Position, report: &mut BarReport) -> Result<()> {
        let Some(side) = position.direction.entry_side() else {
            return Ok(());
        };
        let order = Order::market(&position.symbol, side, position.size, &position.id);
        let submitted = self.client.submit_order(&order).await;

        let mut risk = self.risk.lock().await;
        match submitted {
            Ok(fill) => {
                if (fill.quantity - position.size).abs() > 1e-9 * position.size {
                    warn!(
                        id = %position.id,
                        requested = position.size,
                        filled = fill.quantity,
                        "Entry filled a different quantity than requested"
                    );
                }
                let event = self
                    .core
                    .manager()
                    .fill_entry(position, fill.fill_price, fill.timestamp, &mut risk)
                    .map_err(|v| self.fatal(v))?;
                report.events.push(event);
            }
            Err(e) => {
                error!(id = %position.id, symbol = %position.symbol, error = %e, "Entry order failed");
                let reason = RejectionReason::OrderFailed(e.to_string());
                self.core
                    .manager()
                    .cancel_pending(position, &reason, &mut risk)
                    .map_err(|v| self.fatal(v))?;
                report.rejections.push(Rejection {
                    symbol: position.symbol.clone(),
                    timestamp: position.signal_at,
                    reason,
                });
            }
        }
        Ok(())
    }

    /// Mirror a partial or full close on the exchange. The position record
    /// keeps the level price; differences are the exchange's slippage.
    async fn submit_exit(&self, event: &TradeEvent) {
        if !matches!(
            event.kind,
            TradeEventKind::PartialTpFilled { .. } | TradeEventKind::Closed { .. }
        ) {
            return;
        }
        let Some(side) = event.direction.exit_side() else {
            return;
        };
        let order = Order::market(&event.symbol, side, event.size, &event.position_id);
        match self.client.submit_order(&order).await {
            Ok(fill) => debug!(
                id = %event.position_id,
                level = event.price,
                fill = fill.fill_price,
                "Exit order filled"
            ),
            Err(e) => error!(
                id = %event.position_id,
                symbol = %event.symbol,
                error = %e,
                "Exit order failed; exchange position needs reconciliation"
            ),
        }
    }

    fn fatal(&self, violation: InvariantViolation) -> Error {
        error!(error = %violation, "Invariant violated, stopping live driver");
        self.cancel.store(true, Ordering::Relaxed);
        violation.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use common::{FeatureVector, Fill};
    use strategy::{ConfidenceModel, FeatureError, FeatureExtractor};

    /// Long setup on every bar that closes above its open.
    struct UpBar;

    impl FeatureExtractor for UpBar {
        fn warmup(&self) -> usize {
            1
        }

        fn extract(&self, window: &[Bar]) -> std::result::Result<FeatureVector, FeatureError> {
            let bar = window.last().ok_or(FeatureError::InsufficientHistory { needed: 1, got: 0 })?;
            let mut fv = FeatureVector::new(bar.symbol.clone(), bar.timestamp, bar.close)
                .with_value("atr", 4.0);
            if bar.is_bullish() {
                fv = fv
                    .with_flag("bullish_order_block")
                    .with_flag("bullish_fvg")
                    .with_flag("trend_up");
            }
            Ok(fv)
        }
    }

    struct Sure;

    impl ConfidenceModel for Sure {
        fn predict(&self, _: &FeatureVector) -> std::result::Result<f64, FeatureError> {
            Ok(0.9)
        }
    }

    struct Refusing;

    #[async_trait]
    impl ExchangeClient for Refusing {
        async fn submit_order(&self, _: &Order) -> Result<Fill> {
            Err(Error::Exchange("exchange unreachable".into()))
        }

        async fn current_price(&self, _: &str) -> Result<f64> {
            Err(Error::Exchange("exchange unreachable".into()))
        }
    }

    fn bar(minute: i64, open: f64, close: f64) -> Bar {
        Bar {
            symbol: "BTCUSDT".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minute),
            open,
            high: open.max(close) + 0.5,
            low: open.min(close) - 0.5,
            close,
            volume: 10.0,
        }
    }

    fn driver(client: Arc<dyn ExchangeClient>) -> LiveDriver {
        let config = EngineConfig::default();
        let core = DecisionCore::new(Arc::new(UpBar), Arc::new(Sure), &config).unwrap();
        LiveDriver::new(core, client, &["BTCUSDT".to_string()], &config, 10_000.0, bar(0, 0.0, 0.0).timestamp)
    }

    #[tokio::test]
    async fn failed_entry_order_leaves_no_position() {
        let driver = driver(Arc::new(Refusing));
        let first = driver.on_bar(&bar(0, 100.0, 101.0)).await.unwrap();
        assert!(first.signal.unwrap().is_actionable());
        assert_eq!(driver.risk_snapshot().await.open_positions, 1);

        let second = driver.on_bar(&bar(1, 101.0, 100.5)).await.unwrap();
        assert!(second.events.is_empty());
        assert!(matches!(second.rejections[0].reason, RejectionReason::OrderFailed(_)));
        assert!(driver.positions().await.is_empty());
        assert_eq!(driver.risk_snapshot().await.open_positions, 0);
    }

    #[tokio::test]
    async fn events_are_broadcast_to_subscribers() {
        let client = Arc::new(paper::PaperClient::new(10_000.0, 0.0));
        let driver = driver(client);
        let mut rx = driver.subscribe();

        driver.on_bar(&bar(0, 100.0, 101.0)).await.unwrap();
        let report = driver.on_bar(&bar(1, 101.0, 100.5)).await.unwrap();
        assert_eq!(report.events[0].kind, TradeEventKind::Opened);
        assert_eq!(report.events[0].price, 101.0);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, report.events[0]);
    }

    #[tokio::test]
    async fn untracked_symbol_is_an_error() {
        let driver = driver(Arc::new(Refusing));
        let mut other = bar(0, 1.0, 2.0);
        other.symbol = "DOGEUSDT".into();
        assert!(driver.on_bar(&other).await.is_err());
    }

    #[tokio::test]
    async fn run_consumes_feed_and_force_close_flattens() {
        let client = Arc::new(paper::PaperClient::new(10_000.0, 0.0));
        let driver = Arc::new(driver(client.clone()));
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(driver.clone().run(rx));

        tx.send(bar(0, 100.0, 101.0)).await.unwrap();
        tx.send(bar(1, 101.0, 101.2)).await.unwrap();
        drop(tx);
        handle.await.unwrap().unwrap();

        assert_eq!(driver.positions().await.len(), 1);
        let closed = driver.force_close_all(ExitReason::Manual).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert!(driver.positions().await.is_empty());
        assert!(client.holdings().await.is_empty());
    }
}
