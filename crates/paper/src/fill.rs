use common::{Bar, Direction, EntryTiming, FillModel};

/// Replay fill model: entries fill at a bar price plus adverse slippage.
///
/// With `NextOpen` the entry fills at the open of the bar after the signal,
/// the earliest price a live system could have traded at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BarFillModel {
    pub timing: EntryTiming,
    /// Slippage in basis points, always against the trader.
    pub slippage_bps: f64,
}

impl BarFillModel {
    pub fn new(timing: EntryTiming, slippage_bps: f64) -> Self {
        Self { timing, slippage_bps }
    }
}

impl Default for BarFillModel {
    fn default() -> Self {
        Self::new(EntryTiming::NextOpen, 0.0)
    }
}

impl FillModel for BarFillModel {
    fn timing(&self) -> EntryTiming {
        self.timing
    }

    fn entry_price(&self, direction: Direction, bar: &Bar) -> f64 {
        let reference = match self.timing {
            EntryTiming::NextOpen => bar.open,
            EntryTiming::SignalClose => bar.close,
        };
        with_slippage(reference, direction.sign(), self.slippage_bps)
    }
}

/// Move `price` against a trade whose direction has sign `sign`:
/// buys pay more, sells receive less.
pub fn with_slippage(price: f64, sign: f64, slippage_bps: f64) -> f64 {
    price * (1.0 + sign * slippage_bps / 10_000.0)
}
