use serde::{Deserialize, Serialize};

use common::{Error, Result};

/// Which fill wins when a stop and a take-profit level are both inside the
/// same price update. With bar data the intrabar order is unknown, so the
/// default assumes the worse outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    #[default]
    StopFirst,
    /// For tick data or callers that know the target traded first.
    TakeProfitFirst,
}

/// Trailing-stop rule, in multiples of the initial stop distance (R).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailingConfig {
    pub enabled: bool,
    /// Favorable excursion, in R, before the stop starts to trail.
    pub activation_r: f64,
    /// Distance, in R, the stop trails behind the best price.
    pub distance_r: f64,
}

impl Default for TrailingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            activation_r: 1.0,
            distance_r: 1.0,
        }
    }
}

/// User-configurable risk parameters, the `[risk]` table of the engine config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Fraction of equity risked per trade (e.g. 0.02 = 2%).
    pub risk_per_trade_fraction: f64,
    /// Fraction of session-start equity that may be lost in one session
    /// before new entries stop.
    pub daily_loss_limit_fraction: f64,
    pub max_concurrent_positions: usize,
    /// Signals below this confidence are refused at entry.
    pub min_entry_confidence: f64,
    /// Allow more than one position per symbol.
    pub allow_pyramiding: bool,
    /// Exchange notional floor. Smaller sizes are raised to it.
    pub min_notional: f64,
    /// Exchange notional ceiling. `None` = unbounded.
    pub max_notional: Option<f64>,
    /// Cap on position notional as a fraction of equity. `None` = uncapped.
    pub max_position_fraction: Option<f64>,
    pub trailing: TrailingConfig,
    pub collision_policy: CollisionPolicy,
    /// Hour (UTC) at which the daily risk counters reset.
    pub session_reset_hour_utc: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade_fraction: 0.02,
            daily_loss_limit_fraction: 0.05,
            max_concurrent_positions: 3,
            min_entry_confidence: 0.5,
            allow_pyramiding: false,
            min_notional: 5.0,
            max_notional: None,
            max_position_fraction: None,
            trailing: TrailingConfig::default(),
            collision_policy: CollisionPolicy::StopFirst,
            session_reset_hour_utc: 0,
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<()> {
        let open_unit = |name: &str, v: f64| -> Result<()> {
            if v > 0.0 && v <= 1.0 {
                Ok(())
            } else {
                Err(Error::Config(format!("risk.{name} must be in (0, 1], got {v}")))
            }
        };
        open_unit("risk_per_trade_fraction", self.risk_per_trade_fraction)?;
        open_unit("daily_loss_limit_fraction", self.daily_loss_limit_fraction)?;
        if let Some(f) = self.max_position_fraction {
            if !(f > 0.0) {
                return Err(Error::Config(format!(
                    "risk.max_position_fraction must be positive, got {f}"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.min_entry_confidence) {
            return Err(Error::Config(format!(
                "risk.min_entry_confidence must be in [0, 1], got {}",
                self.min_entry_confidence
            )));
        }
        if self.max_concurrent_positions == 0 {
            return Err(Error::Config("risk.max_concurrent_positions must be at least 1".into()));
        }
        if self.min_notional < 0.0 {
            return Err(Error::Config("risk.min_notional must be non-negative".into()));
        }
        if let Some(max) = self.max_notional {
            if max < self.min_notional {
                return Err(Error::Config(format!(
                    "risk.max_notional {max} is below risk.min_notional {}",
                    self.min_notional
                )));
            }
        }
        if self.trailing.enabled && !(self.trailing.distance_r > 0.0 && self.trailing.activation_r >= 0.0) {
            return Err(Error::Config(
                "risk.trailing needs activation_r >= 0 and distance_r > 0".into(),
            ));
        }
        if self.session_reset_hour_utc > 23 {
            return Err(Error::Config(format!(
                "risk.session_reset_hour_utc must be 0..=23, got {}",
                self.session_reset_hour_utc
            )));
        }
        Ok(())
    }
}
