use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};

use common::{Bar, EntryTiming};
use engine::{DecisionCore, EngineConfig, LiveDriver, ReplayEngine};
use paper::PaperClient;
use strategy::{ExtractorConfig, LogisticModel, StructureExtractor};

/// Deterministic zig-zag with drift, different per symbol.
fn series(symbol: &str, phase: f64, n: i64) -> Vec<Bar> {
    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
    let mut close = 1_000.0;
    (0..n)
        .map(|i| {
            let open = close;
            let step = ((i as f64 + phase) * 0.9).sin() * 0.012 + 0.001;
            close = open * (1.0 + step);
            Bar {
                symbol: symbol.into(),
                timestamp: t0 + Duration::hours(i),
                open,
                high: open.max(close) * 1.004,
                low: open.min(close) * 0.996,
                close,
                volume: 50.0 + ((i as f64 + phase) * 1.3).cos().abs() * 100.0,
            }
        })
        .collect()
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.extractor = ExtractorConfig {
        atr_period: 5,
        ema_fast: 3,
        ema_slow: 8,
        ema_htf: 20,
        rsi_period: 5,
        volume_period: 5,
        structure_lookback: 5,
        ..ExtractorConfig::default()
    };
    config.scorer.long.score = 0.3;
    config.scorer.short.score = 0.3;
    config.scorer.long.confidence = 0.5;
    config.scorer.short.confidence = 0.5;
    config.risk.max_notional = Some(2_000.0);
    config.replay.entry_timing = EntryTiming::NextOpen;
    config.replay.slippage_bps = 5.0;
    config.replay.close_at_end = false;
    config
}

fn core(config: &EngineConfig) -> DecisionCore {
    DecisionCore::new(
        Arc::new(StructureExtractor::new(config.extractor.clone())),
        Arc::new(LogisticModel::new(config.model.clone())),
        config,
    )
    .unwrap()
}

/// The same bars through replay and through the live driver on a paper
/// exchange with the same slippage produce the same event stream.
#[tokio::test]
async fn replay_and_live_paper_agree() {
    let config = config();
    let mut bars = series("BTCUSDT", 0.0, 120);
    bars.extend(series("ETHUSDT", 2.0, 120));

    let replay = ReplayEngine::new(
        Arc::new(StructureExtractor::new(config.extractor.clone())),
        Arc::new(LogisticModel::new(config.model.clone())),
        config.clone(),
        10_000.0,
    )
    .unwrap()
    .run(&bars)
    .unwrap();

    let mut timeline = bars.clone();
    timeline.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.symbol.cmp(&b.symbol)));
    let client = Arc::new(PaperClient::new(10_000.0, config.replay.slippage_bps));
    let symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
    let driver = LiveDriver::new(core(&config), client, &symbols, &config, 10_000.0, timeline[0].timestamp);

    let mut events = Vec::new();
    let mut rejections = Vec::new();
    for bar in &timeline {
        let report = driver.on_bar(bar).await.unwrap();
        events.extend(report.events);
        rejections.extend(report.rejections);
    }

    assert!(!replay.events.is_empty(), "series should trade at least once");
    assert_eq!(events, replay.events);
    assert_eq!(rejections, replay.rejections);
    assert_eq!(driver.risk_snapshot().await, replay.final_risk);
}
