use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use common::{EntryTiming, Error, Result};
use risk::RiskConfig;
use strategy::{ExtractorConfig, ModelConfig, ScorerConfig};

/// `[replay]` table: how simulated execution behaves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub entry_timing: EntryTiming,
    /// Entry slippage in basis points, against the trader.
    pub slippage_bps: f64,
    /// Force-close whatever is still open at the last bar's close.
    pub close_at_end: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            entry_timing: EntryTiming::NextOpen,
            slippage_bps: 0.0,
            close_at_end: true,
        }
    }
}

/// Everything a decision pipeline needs, loaded from one TOML file.
/// Every table and every field is optional.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scorer: ScorerConfig,
    pub risk: RiskConfig,
    pub replay: ReplayConfig,
    pub extractor: ExtractorConfig,
    pub model: ModelConfig,
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read engine config {}: {e}", path.display()))
        })?;
        let config = Self::from_toml_str(&raw)?;
        info!(path = %path.display(), "Engine config loaded");
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.scorer.validate()?;
        self.risk.validate()?;
        self.extractor.validate()?;
        if !(self.replay.slippage_bps >= 0.0 && self.replay.slippage_bps.is_finite()) {
            return Err(Error::Config(format!(
                "replay.slippage_bps must be a non-negative number, got {}",
                self.replay.slippage_bps
            )));
        }
        // A next-open entry needs at least the fill bar inside its validity window.
        if self.scorer.signal_valid_bars == 0 && self.replay.entry_timing == EntryTiming::NextOpen {
            return Err(Error::Config(
                "scorer.signal_valid_bars must be at least 1 with replay.entry_timing = \"next_open\"".into(),
            ));
        }
        Ok(())
    }
}
