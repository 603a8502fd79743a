use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use common::FeatureVector;

use crate::{ConfidenceModel, FeatureError};

/// Coefficients of [`LogisticModel`], the `[model]` table of the engine config.
///
/// Coefficients come from an offline training job; this crate only applies
/// them.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelConfig {
    pub bias: f64,
    /// Coefficient per numeric feature. Every named feature must be present.
    pub weights: BTreeMap<String, f64>,
    /// Coefficient per structural flag, applied when the flag is set.
    pub flag_weights: BTreeMap<String, f64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        let flag_weights = [
            ("trend_up", 0.6),
            ("trend_down", 0.6),
            ("bullish_order_block", 0.5),
            ("bearish_order_block", 0.5),
            ("bullish_fvg", 0.3),
            ("bearish_fvg", 0.3),
            ("volume_spike", 0.4),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            bias: -0.2,
            weights: BTreeMap::new(),
            flag_weights,
        }
    }
}

/// Linear model over named features squashed through a sigmoid.
#[derive(Debug, Clone, Default)]
pub struct LogisticModel {
    config: ModelConfig,
}

impl LogisticModel {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }
}

impl ConfidenceModel for LogisticModel {
    fn predict(&self, features: &FeatureVector) -> Result<f64, FeatureError> {
        let mut z = self.config.bias;
        for (name, weight) in &self.config.weights {
            let value = features
                .value(name)
                .ok_or_else(|| FeatureError::ModelUnavailable(format!("missing feature '{name}'")))?;
            if !value.is_finite() {
                return Err(FeatureError::NonFinite(name.clone()));
            }
            z += weight * value;
        }
        for (flag, weight) in &self.config.flag_weights {
            if features.has_flag(flag) {
                z += weight;
            }
        }
        if !z.is_finite() {
            return Err(FeatureError::NonFinite("logit".into()));
        }
        Ok(1.0 / (1.0 + (-z).exp()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn fv() -> FeatureVector {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        FeatureVector::new("ETHUSDT", t, 2_000.0).with_value("rsi", 55.0)
    }

    #[test]
    fn zero_logit_is_half() {
        let model = LogisticModel::new(ModelConfig {
            bias: 0.0,
            weights: BTreeMap::new(),
            flag_weights: BTreeMap::new(),
        });
        assert!((model.predict(&fv()).unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn flags_raise_confidence() {
        let model = LogisticModel::default();
        let plain = model.predict(&fv()).unwrap();
        let flagged = model.predict(&fv().with_flag("trend_up")).unwrap();
        assert!(flagged > plain);
        assert!((0.0..=1.0).contains(&flagged));
    }

    #[test]
    fn missing_feature_is_reported() {
        let mut weights = BTreeMap::new();
        weights.insert("atr".to_string(), 1.0);
        let model = LogisticModel::new(ModelConfig {
            bias: 0.0,
            weights,
            flag_weights: BTreeMap::new(),
        });
        assert!(matches!(
            model.predict(&fv()),
            Err(FeatureError::ModelUnavailable(_))
        ));
    }
}
