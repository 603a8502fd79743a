use serde::{Deserialize, Serialize};

use common::{Bar, Error, FeatureVector, Result as ConfigResult};

use crate::indicators::{atr, ema, rsi};
use crate::{FeatureError, FeatureExtractor};

/// Parameters of [`StructureExtractor`], the `[extractor]` table of the
/// engine config.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub atr_period: usize,
    pub ema_fast: usize,
    pub ema_slow: usize,
    /// Long EMA standing in for the higher-timeframe trend.
    pub ema_htf: usize,
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub volume_period: usize,
    pub volume_spike_ratio: f64,
    /// How many recent bars are searched for unfilled gaps and order blocks.
    pub structure_lookback: usize,
    /// Move away from an order block, in ATRs, that makes it count.
    pub impulse_atr_multiple: f64,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            atr_period: 14,
            ema_fast: 21,
            ema_slow: 50,
            ema_htf: 200,
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            volume_period: 20,
            volume_spike_ratio: 2.0,
            structure_lookback: 10,
            impulse_atr_multiple: 1.5,
        }
    }
}

impl ExtractorConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        let periods = [
            ("atr_period", self.atr_period),
            ("ema_fast", self.ema_fast),
            ("ema_slow", self.ema_slow),
            ("ema_htf", self.ema_htf),
            ("rsi_period", self.rsi_period),
            ("volume_period", self.volume_period),
            ("structure_lookback", self.structure_lookback),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, p)| *p == 0) {
            return Err(Error::Config(format!("extractor.{name} must be at least 1")));
        }
        if self.ema_fast >= self.ema_slow {
            return Err(Error::Config(format!(
                "extractor.ema_fast ({}) must be shorter than ema_slow ({})",
                self.ema_fast, self.ema_slow
            )));
        }
        if !(self.rsi_oversold < self.rsi_overbought) {
            return Err(Error::Config("extractor.rsi_oversold must be below rsi_overbought".into()));
        }
        Ok(())
    }
}

/// Reference feature extractor: volatility, trend regime, momentum, fair
/// value gaps and order blocks computed from the window alone.
///
/// Values: `atr`, `atr_pct`, `ema_fast`, `ema_slow`, `ema_htf`, `rsi`,
/// `volume_ratio`.
/// Flags: `trend_up`/`trend_down`, `htf_trend_up`/`htf_trend_down`,
/// `rsi_oversold`/`rsi_overbought`, `bullish_fvg`/`bearish_fvg`,
/// `bullish_order_block`/`bearish_order_block`, `volume_spike`.
#[derive(Debug, Clone, Default)]
pub struct StructureExtractor {
    config: ExtractorConfig,
}

impl StructureExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self { config }
    }
}

impl FeatureExtractor for StructureExtractor {
    fn warmup(&self) -> usize {
        let c = &self.config;
        (c.atr_period + 1)
            .max(c.ema_fast)
            .max(c.ema_slow)
            .max(c.ema_htf)
            .max(c.rsi_period + 1)
            .max(c.volume_period + 1)
            .max(c.structure_lookback + 2)
    }

    fn extract(&self, window: &[Bar]) -> Result<FeatureVector, FeatureError> {
        let needed = self.warmup();
        if window.len() < needed {
            return Err(FeatureError::InsufficientHistory {
                needed,
                got: window.len(),
            });
        }
        validate_window(window)?;

        let c = &self.config;
        let last = &window[window.len() - 1];
        let closes: Vec<f64> = window.iter().map(|b| b.close).collect();

        let atr = atr(window, c.atr_period).ok_or_else(|| insufficient(window, c.atr_period + 1))?;
        let ema_fast = ema(&closes, c.ema_fast).ok_or_else(|| insufficient(window, c.ema_fast))?;
        let ema_slow = ema(&closes, c.ema_slow).ok_or_else(|| insufficient(window, c.ema_slow))?;
        let ema_htf = ema(&closes, c.ema_htf).ok_or_else(|| insufficient(window, c.ema_htf))?;
        let rsi = rsi(&closes, c.rsi_period).ok_or_else(|| insufficient(window, c.rsi_period + 1))?;

        let prior = &window[window.len() - 1 - c.volume_period..window.len() - 1];
        let avg_volume = prior.iter().map(|b| b.volume).sum::<f64>() / c.volume_period as f64;
        let volume_ratio = if avg_volume > 0.0 {
            last.volume / avg_volume
        } else {
            0.0
        };

        let mut fv = FeatureVector::new(last.symbol.clone(), last.timestamp, last.close)
            .with_value("atr", atr)
            .with_value("atr_pct", atr / last.close)
            .with_value("ema_fast", ema_fast)
            .with_value("ema_slow", ema_slow)
            .with_value("ema_htf", ema_htf)
            .with_value("rsi", rsi)
            .with_value("volume_ratio", volume_ratio);

        if let Some((name, _)) = fv.values.iter().find(|(_, v)| !v.is_finite()) {
            return Err(FeatureError::NonFinite(name.clone()));
        }

        if ema_fast > ema_slow && last.close > ema_slow {
            fv = fv.with_flag("trend_up");
        } else if ema_fast < ema_slow && last.close < ema_slow {
            fv = fv.with_flag("trend_down");
        }
        if last.close > ema_htf {
            fv = fv.with_flag("htf_trend_up");
        } else if last.close < ema_htf {
            fv = fv.with_flag("htf_trend_down");
        }
        if rsi <= c.rsi_oversold {
            fv = fv.with_flag("rsi_oversold");
        } else if rsi >= c.rsi_overbought {
            fv = fv.with_flag("rsi_overbought");
        }
        if volume_ratio >= c.volume_spike_ratio {
            fv = fv.with_flag("volume_spike");
        }

        let recent = &window[window.len() - (c.structure_lookback + 2)..];
        if has_open_gap(recent, true) {
            fv = fv.with_flag("bullish_fvg");
        }
        if has_open_gap(recent, false) {
            fv = fv.with_flag("bearish_fvg");
        }
        let impulse = c.impulse_atr_multiple * atr;
        if has_order_block(recent, impulse, true) {
            fv = fv.with_flag("bullish_order_block");
        }
        if has_order_block(recent, impulse, false) {
            fv = fv.with_flag("bearish_order_block");
        }

        Ok(fv)
    }
}

fn insufficient(window: &[Bar], needed: usize) -> FeatureError {
    FeatureError::InsufficientHistory {
        needed,
        got: window.len(),
    }
}

fn validate_window(window: &[Bar]) -> Result<(), FeatureError> {
    let symbol = &window[0].symbol;
    for pair in window.windows(2) {
        if pair[1].timestamp <= pair[0].timestamp {
            return Err(FeatureError::Malformed(format!(
                "timestamps not increasing at {}",
                pair[1].timestamp
            )));
        }
    }
    for bar in window {
        if &bar.symbol != symbol {
            return Err(FeatureError::Malformed(format!(
                "mixed symbols in window: {} and {}",
                symbol, bar.symbol
            )));
        }
        let prices = [bar.open, bar.high, bar.low, bar.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) || bar.high < bar.low {
            return Err(FeatureError::Malformed(format!(
                "bad prices on {} at {}",
                bar.symbol, bar.timestamp
            )));
        }
    }
    Ok(())
}

/// A three-bar gap that later bars have not traded back into.
///
/// Bullish: `bars[i].low > bars[i - 2].high`, and no later low reached the
/// top of bar `i - 2`. Bearish is the mirror.
fn has_open_gap(bars: &[Bar], bullish: bool) -> bool {
    (2..bars.len()).any(|i| {
        let (before, after) = (&bars[i - 2], &bars[i]);
        let rest = &bars[i + 1..];
        if bullish {
            after.low > before.high && rest.iter().all(|b| b.low > before.high)
        } else {
            after.high < before.low && rest.iter().all(|b| b.high < before.low)
        }
    })
}

/// The last opposite-colored candle before an impulsive move, still
/// respected by price.
///
/// Bullish: a bearish candle whose high is exceeded by a later close by at
/// least `impulse`, with the latest close still above its low.
fn has_order_block(bars: &[Bar], impulse: f64, bullish: bool) -> bool {
    let last_close = bars[bars.len() - 1].close;
    (0..bars.len() - 1).rev().any(|i| {
        let candle = &bars[i];
        let later = &bars[i + 1..];
        if bullish {
            candle.is_bearish()
                && later.iter().any(|b| b.close - candle.high >= impulse)
                && last_close > candle.low
        } else {
            candle.is_bullish()
                && later.iter().any(|b| candle.low - b.close >= impulse)
                && last_close < candle.high
        }
    })
}
