use serde::{Deserialize, Serialize};

use common::{Error, Result};

/// Whether a structural flag argues for longs or shorts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Bias {
    Bullish,
    Bearish,
}

/// Weight of one named flag in the structure score.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FlagWeight {
    pub flag: String,
    pub bias: Bias,
    pub weight: f64,
}

impl FlagWeight {
    pub fn new(flag: impl Into<String>, bias: Bias, weight: f64) -> Self {
        Self {
            flag: flag.into(),
            bias,
            weight,
        }
    }
}

/// Composite and confidence floors one direction must clear. Both are
/// exclusive: a value equal to the floor does not qualify.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Thresholds {
    pub score: f64,
    pub confidence: f64,
}

/// One take-profit rung, expressed in multiples of the stop distance.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct LadderStep {
    pub r_multiple: f64,
    pub fraction: f64,
}

/// Scorer parameters, the `[scorer]` table of the engine config.
///
/// Example:
/// ```toml
/// [scorer]
/// confidence_weight = 0.4
/// min_confidence = 0.5
/// htf_bearish_flag = "htf_trend_down"
///
/// [[scorer.flags]]
/// flag = "bullish_order_block"
/// bias = "bullish"
/// weight = 2.0
///
/// [[scorer.take_profit_ladder]]
/// r_multiple = 1.0
/// fraction = 0.5
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScorerConfig {
    pub flags: Vec<FlagWeight>,
    /// Present flag blocks shorts.
    pub htf_bullish_flag: Option<String>,
    /// Present flag blocks longs.
    pub htf_bearish_flag: Option<String>,
    /// Share of the composite taken by model confidence; the rest is structure.
    pub confidence_weight: f64,
    /// Below this confidence every signal is neutral.
    pub min_confidence: f64,
    pub long: Thresholds,
    pub short: Thresholds,
    /// Feature name holding the volatility measure used for stops.
    pub atr_feature: String,
    pub atr_stop_multiplier: f64,
    /// Floor on stop distance, in basis points of entry.
    pub min_stop_bps: f64,
    /// Entry offset from the last close, in basis points, applied against the trade.
    pub entry_offset_bps: f64,
    pub take_profit_ladder: Vec<LadderStep>,
    pub signal_valid_bars: u32,
    /// Composite at or above which a signal is graded strong.
    pub strong_grade: f64,
    /// Composite at or above which a signal is graded moderate.
    pub moderate_grade: f64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            flags: vec![
                FlagWeight::new("bullish_order_block", Bias::Bullish, 2.0),
                FlagWeight::new("bullish_fvg", Bias::Bullish, 1.5),
                FlagWeight::new("trend_up", Bias::Bullish, 1.5),
                FlagWeight::new("rsi_oversold", Bias::Bullish, 1.0),
                FlagWeight::new("bearish_order_block", Bias::Bearish, 2.0),
                FlagWeight::new("bearish_fvg", Bias::Bearish, 1.5),
                FlagWeight::new("trend_down", Bias::Bearish, 1.5),
                FlagWeight::new("rsi_overbought", Bias::Bearish, 1.0),
            ],
            htf_bullish_flag: Some("htf_trend_up".into()),
            htf_bearish_flag: Some("htf_trend_down".into()),
            confidence_weight: 0.4,
            min_confidence: 0.5,
            long: Thresholds { score: 0.6, confidence: 0.6 },
            short: Thresholds { score: 0.6, confidence: 0.6 },
            atr_feature: "atr".into(),
            atr_stop_multiplier: 2.5,
            min_stop_bps: 10.0,
            entry_offset_bps: 0.0,
            take_profit_ladder: vec![
                LadderStep { r_multiple: 1.0, fraction: 0.5 },
                LadderStep { r_multiple: 2.0, fraction: 0.3 },
                LadderStep { r_multiple: 3.0, fraction: 0.2 },
            ],
            signal_valid_bars: 1,
            strong_grade: 0.8,
            moderate_grade: 0.65,
        }
    }
}

impl ScorerConfig {
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| -> Result<()> {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(Error::Config(format!("scorer.{name} must be in [0, 1], got {v}")))
            }
        };
        unit("confidence_weight", self.confidence_weight)?;
        unit("min_confidence", self.min_confidence)?;
        unit("long.score", self.long.score)?;
        unit("long.confidence", self.long.confidence)?;
        unit("short.score", self.short.score)?;
        unit("short.confidence", self.short.confidence)?;
        unit("strong_grade", self.strong_grade)?;
        unit("moderate_grade", self.moderate_grade)?;

        if let Some(bad) = self.flags.iter().find(|f| !(f.weight >= 0.0)) {
            return Err(Error::Config(format!(
                "scorer flag '{}' has negative weight {}",
                bad.flag, bad.weight
            )));
        }
        if !(self.atr_stop_multiplier > 0.0) {
            return Err(Error::Config(format!(
                "scorer.atr_stop_multiplier must be positive, got {}",
                self.atr_stop_multiplier
            )));
        }
        if self.min_stop_bps < 0.0 || self.entry_offset_bps < 0.0 {
            return Err(Error::Config(
                "scorer.min_stop_bps and scorer.entry_offset_bps must be non-negative".into(),
            ));
        }
        validate_ladder(&self.take_profit_ladder)
    }
}

/// Ladder must be non-empty, strictly increasing in R, with positive
/// fractions summing to one.
pub fn validate_ladder(ladder: &[LadderStep]) -> Result<()> {
    if ladder.is_empty() {
        return Err(Error::Config("take_profit_ladder must not be empty".into()));
    }
    let mut previous = 0.0;
    for step in ladder {
        if !(step.r_multiple > previous) {
            return Err(Error::Config(format!(
                "take_profit_ladder r_multiple must be positive and strictly increasing, got {}",
                step.r_multiple
            )));
        }
        if !(step.fraction > 0.0 && step.fraction <= 1.0) {
            return Err(Error::Config(format!(
                "take_profit_ladder fraction must be in (0, 1], got {}",
                step.fraction
            )));
        }
        previous = step.r_multiple;
    }
    let total: f64 = ladder.iter().map(|s| s.fraction).sum();
    if (total - 1.0).abs() > 1e-9 {
        return Err(Error::Config(format!(
            "take_profit_ladder fractions must sum to 1.0, got {total}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ScorerConfig::default().validate().unwrap();
    }

    #[test]
    fn ladder_fractions_must_sum_to_one() {
        let ladder = vec![
            LadderStep { r_multiple: 1.0, fraction: 0.5 },
            LadderStep { r_multiple: 2.0, fraction: 0.4 },
        ];
        assert!(validate_ladder(&ladder).is_err());
    }

    #[test]
    fn ladder_must_increase() {
        let ladder = vec![
            LadderStep { r_multiple: 2.0, fraction: 0.5 },
            LadderStep { r_multiple: 1.0, fraction: 0.5 },
        ];
        assert!(validate_ladder(&ladder).is_err());
    }

    #[test]
    fn parses_from_toml_with_defaults() {
        let cfg: ScorerConfig = toml::from_str(
            r#"
            min_confidence = 0.7

            [[take_profit_ladder]]
            r_multiple = 1.5
            fraction = 1.0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.min_confidence, 0.7);
        assert_eq!(cfg.take_profit_ladder.len(), 1);
        assert_eq!(cfg.atr_feature, "atr");
        cfg.validate().unwrap();
    }
}
