use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Bar, Direction, Fill, Order, Result};

/// Abstraction over the exchange connection used by the live driver.
///
/// `PaperClient` implements this for paper trading. A real exchange client
/// lives outside this workspace and only has to satisfy this trait. Slippage
/// reconciliation is the caller's job: the driver records the price in the
/// returned `Fill`, not the price it asked for.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Submit an order and return the fill confirmation.
    async fn submit_order(&self, order: &Order) -> Result<Fill>;

    /// Get the latest price for a symbol.
    async fn current_price(&self, symbol: &str) -> Result<f64>;

    /// Market price observed by the driver's feed. Real exchanges know their
    /// own prices and ignore it; simulated ones fill against it.
    async fn on_market_price(&self, _symbol: &str, _price: f64, _at: DateTime<Utc>) -> Result<()> {
        Ok(())
    }
}

/// When an accepted signal's entry is allowed to fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryTiming {
    /// Fill at the open of the bar after the signal bar.
    #[default]
    NextOpen,
    /// Fill at the close of the signal bar.
    SignalClose,
}

/// Simulated execution used in place of an exchange during replay.
///
/// Entry fills are the only thing a fill model decides. Stop and
/// take-profit fills are resolved by the position manager against the
/// resting price using the bar's high and low.
pub trait FillModel: Send + Sync {
    fn timing(&self) -> EntryTiming;

    /// Fill price for an entry in `direction` against `bar`.
    /// For `NextOpen` this is called with the fill bar, for `SignalClose`
    /// with the signal bar.
    fn entry_price(&self, direction: Direction, bar: &Bar) -> f64;
}
