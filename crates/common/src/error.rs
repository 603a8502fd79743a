use chrono::{DateTime, Utc};
use thiserror::Error;

/// Internal-consistency faults. These are programming errors, not business
/// outcomes: a run that hits one must halt, because every number it would
/// produce afterwards is meaningless.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvariantViolation {
    #[error("lookahead on {symbol}: decision at {decision_at} used data from {data_at}")]
    Lookahead {
        symbol: String,
        decision_at: DateTime<Utc>,
        data_at: DateTime<Utc>,
    },

    #[error("out-of-order bar on {symbol}: {next} does not follow {previous}")]
    OutOfOrderBar {
        symbol: String,
        previous: DateTime<Utc>,
        next: DateTime<Utc>,
    },

    #[error(
        "size leak on position {position_id}: closed {closed} + remaining {remaining} != size {size}"
    )]
    SizeLeak {
        position_id: String,
        size: f64,
        closed: f64,
        remaining: f64,
    },

    #[error("remaining size increased on position {position_id}: {before} -> {after}")]
    SizeIncreased {
        position_id: String,
        before: f64,
        after: f64,
    },

    #[error("illegal transition on position {position_id}: {from} -> {to}")]
    IllegalTransition {
        position_id: String,
        from: String,
        to: &'static str,
    },

    #[error("stop loosened on position {position_id}: {before} -> {after}")]
    StopLoosened {
        position_id: String,
        before: f64,
        after: f64,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invariant violated: {0}")]
    Invariant(#[from] InvariantViolation),

    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
