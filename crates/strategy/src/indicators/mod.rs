//! Indicator helpers used by the reference extractor.
//!
//! All functions take data oldest first and return `None` when the input is
//! too short to produce a value.

pub mod atr;
pub mod ema;
pub mod rsi;

pub use atr::atr;
pub use ema::{ema, ema_series};
pub use rsi::rsi;
