pub mod config;
pub mod error;
pub mod exchange;
pub mod types;

pub use config::Config;
pub use error::{Error, InvariantViolation, Result};
pub use exchange::{EntryTiming, ExchangeClient, FillModel};
pub use types::*;
