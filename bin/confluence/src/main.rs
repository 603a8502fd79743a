use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use common::{Bar, Config, ExitReason, TradeEvent, TradingMode};
use engine::{DecisionCore, EngineConfig, LiveDriver, PerformanceSummary, ReplayEngine};
use paper::PaperClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ────────────────────────────────────────────────────────────────
    let cfg = Config::from_env()?;
    info!(mode = %cfg.trading_mode, "Confluence starting");
    let engine_cfg = EngineConfig::load(&cfg.engine_config_path)?;

    // ── Bars ──────────────────────────────────────────────────────────────────
    let bars = read_bars(&cfg.bars_path)?;
    if bars.is_empty() {
        bail!("{} contains no bars", cfg.bars_path);
    }
    info!(bars = bars.len(), path = %cfg.bars_path, "Bars loaded");

    let (events, summary) = match cfg.trading_mode {
        TradingMode::Replay => replay(bars, engine_cfg, cfg.initial_equity)?,
        TradingMode::Paper => paper(bars, engine_cfg, &cfg).await?,
    };

    if let Some(path) = &cfg.events_out_path {
        write_events(path, &events)?;
        info!(events = events.len(), path = %path, "Events written");
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn replay(
    bars: Vec<Bar>,
    engine_cfg: EngineConfig,
    equity: f64,
) -> anyhow::Result<(Vec<TradeEvent>, PerformanceSummary)> {
    let engine = ReplayEngine::reference(engine_cfg, equity)?;
    let report = engine.run(&bars)?;
    if !report.open_positions.is_empty() {
        warn!(open = report.open_positions.len(), "Replay ended with open positions");
    }
    Ok((report.events, report.summary))
}

/// Stream the bar file through the live driver against the paper exchange,
/// then flatten whatever is left.
async fn paper(
    mut bars: Vec<Bar>,
    engine_cfg: EngineConfig,
    cfg: &Config,
) -> anyhow::Result<(Vec<TradeEvent>, PerformanceSummary)> {
    bars.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.symbol.cmp(&b.symbol)));
    let mut symbols: Vec<String> = bars.iter().map(|b| b.symbol.clone()).collect();
    symbols.sort();
    symbols.dedup();

    let client = Arc::new(PaperClient::new(cfg.initial_equity, cfg.paper_slippage_bps));
    let core = DecisionCore::reference(&engine_cfg)?;
    let start = bars[0].timestamp;
    let driver = Arc::new(LiveDriver::new(
        core,
        client.clone(),
        &symbols,
        &engine_cfg,
        cfg.initial_equity,
        start,
    ));

    // Collect from the broadcast before the feed starts.
    let mut rx = driver.subscribe();
    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        loop {
            match rx.recv().await {
                Ok(event) => events.push(event),
                Err(RecvError::Lagged(missed)) => warn!(missed, "Event collector fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
        events
    });

    let (feed_tx, feed_rx) = mpsc::channel::<Bar>(256);
    let runner = tokio::spawn(driver.clone().run(feed_rx));
    for bar in bars {
        if feed_tx.send(bar).await.is_err() {
            break;
        }
    }
    drop(feed_tx);
    runner.await.context("live driver task panicked")??;

    driver.force_close_all(ExitReason::SessionEnd).await?;
    let risk = driver.risk_snapshot().await;
    drop(driver);
    let events = collector.await.context("event collector panicked")?;

    let cash = client.balance().await;
    info!(equity = risk.equity, cash, "Paper session finished");
    let summary = PerformanceSummary::from_events(&events, cfg.initial_equity, 0);
    Ok((events, summary))
}

fn read_bars(path: &str) -> anyhow::Result<Vec<Bar>> {
    let file = File::open(path).with_context(|| format!("cannot open bar file {path}"))?;
    let mut bars = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let bar: Bar = serde_json::from_str(&line)
            .with_context(|| format!("{path}:{}: malformed bar", n + 1))?;
        bars.push(bar);
    }
    Ok(bars)
}

fn write_events(path: &str, events: &[TradeEvent]) -> anyhow::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for event in events {
        serde_json::to_writer(&mut out, event)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}
