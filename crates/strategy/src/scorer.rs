use tracing::debug;

use common::{
    Direction, FeatureVector, Invalidation, Result, Signal, SignalGrade, TakeProfitLevel,
};

use crate::config::{Bias, ScorerConfig};

/// Fuses structural flags and a model confidence into a trade decision.
///
/// Scoring is pure: the same features, confidence and config always produce
/// the same `Signal`, bit for bit. Nothing here blocks or allocates beyond
/// the returned value.
#[derive(Debug, Clone)]
pub struct SignalScorer {
    config: ScorerConfig,
}

impl SignalScorer {
    pub fn new(config: ScorerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    pub fn score(&self, features: &FeatureVector, confidence: f64) -> Signal {
        score(features, confidence, &self.config)
    }
}

/// Weighted share of one side's configured flags that are present, in `[0, 1]`.
fn structure_score(features: &FeatureVector, config: &ScorerConfig, bias: Bias) -> (f64, Vec<String>) {
    let mut total = 0.0;
    let mut present = 0.0;
    let mut reasons = Vec::new();
    for fw in config.flags.iter().filter(|f| f.bias == bias) {
        total += fw.weight;
        if features.has_flag(&fw.flag) {
            present += fw.weight;
            reasons.push(fw.flag.clone());
        }
    }
    if total > 0.0 {
        (present / total, reasons)
    } else {
        (0.0, reasons)
    }
}

fn grade(score: f64, config: &ScorerConfig) -> SignalGrade {
    if score >= config.strong_grade {
        SignalGrade::Strong
    } else if score >= config.moderate_grade {
        SignalGrade::Moderate
    } else {
        SignalGrade::Weak
    }
}

fn flag_set(features: &FeatureVector, flag: &Option<String>) -> bool {
    flag.as_deref().is_some_and(|f| features.has_flag(f))
}

/// Score one feature vector. See [`SignalScorer`].
pub fn score(features: &FeatureVector, confidence: f64, config: &ScorerConfig) -> Signal {
    let confidence = if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let cw = config.confidence_weight;

    let (bull, bull_reasons) = structure_score(features, config, Bias::Bullish);
    let (bear, bear_reasons) = structure_score(features, config, Bias::Bearish);
    let long_score = ((1.0 - cw) * bull + cw * confidence).clamp(0.0, 1.0);
    let short_score = ((1.0 - cw) * bear + cw * confidence).clamp(0.0, 1.0);

    let htf_up = flag_set(features, &config.htf_bullish_flag);
    let htf_down = flag_set(features, &config.htf_bearish_flag);

    let long_ok = long_score > config.long.score
        && confidence > config.long.confidence
        && !htf_down;
    let short_ok = short_score > config.short.score
        && confidence > config.short.confidence
        && !htf_up;

    let mut direction = if confidence < config.min_confidence {
        Direction::Neutral
    } else if long_ok && (!short_ok || long_score > short_score) {
        Direction::Long
    } else if short_ok && (!long_ok || short_score > long_score) {
        Direction::Short
    } else {
        Direction::Neutral
    };

    let close = features.close;
    let atr = features.value(&config.atr_feature);
    let atr = match atr {
        Some(a) if a.is_finite() && a > 0.0 => a,
        _ => {
            if direction != Direction::Neutral {
                debug!(
                    symbol = %features.symbol,
                    feature = %config.atr_feature,
                    "No usable volatility measure, signal downgraded to neutral"
                );
            }
            direction = Direction::Neutral;
            0.0
        }
    };
    if !(close.is_finite() && close > 0.0) {
        direction = Direction::Neutral;
    }

    let (score, reasons) = match direction {
        Direction::Long => (long_score, bull_reasons),
        Direction::Short => (short_score, bear_reasons),
        Direction::Neutral => (long_score.max(short_score), Vec::new()),
    };

    if direction == Direction::Neutral {
        return Signal {
            symbol: features.symbol.clone(),
            timestamp: features.timestamp,
            direction,
            confidence,
            score,
            grade: grade(score, config),
            entry_price: close,
            stop_loss: close,
            take_profits: Vec::new(),
            invalidation: Invalidation {
                price: close,
                valid_bars: 0,
            },
            risk_reward: 0.0,
            reasons,
        };
    }

    let sign = direction.sign();
    let entry = close * (1.0 + sign * config.entry_offset_bps / 10_000.0);
    let stop_distance = (atr * config.atr_stop_multiplier).max(entry * config.min_stop_bps / 10_000.0);
    let stop = entry - sign * stop_distance;

    let take_profits: Vec<TakeProfitLevel> = config
        .take_profit_ladder
        .iter()
        .map(|step| TakeProfitLevel {
            price: entry + sign * step.r_multiple * stop_distance,
            fraction: step.fraction,
        })
        .collect();
    let risk_reward = config
        .take_profit_ladder
        .last()
        .map(|s| s.r_multiple)
        .unwrap_or(0.0);

    Signal {
        symbol: features.symbol.clone(),
        timestamp: features.timestamp,
        direction,
        confidence,
        score,
        grade: grade(score, config),
        entry_price: entry,
        stop_loss: stop,
        take_profits,
        invalidation: Invalidation {
            price: stop,
            valid_bars: config.signal_valid_bars,
        },
        risk_reward,
        reasons,
    }
}
