use crate::{Error, Result, TradingMode};

/// Process-level configuration loaded from environment variables at startup.
///
/// Strategy and risk parameters live in the engine TOML file pointed to by
/// `engine_config_path`; this struct only carries what differs per process.
#[derive(Debug, Clone)]
pub struct Config {
    pub trading_mode: TradingMode,

    /// Path to the engine TOML file.
    pub engine_config_path: String,

    /// JSON-lines file of bars. Replay reads it whole; paper mode streams it.
    pub bars_path: String,

    /// Where to write the TradeEvent stream as JSON lines, if anywhere.
    pub events_out_path: Option<String>,

    pub initial_equity: f64,
    pub paper_slippage_bps: f64,
}

impl Config {
    /// Load configuration from environment variables.
    /// Loads `.env` if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv(); // ignore error if .env not present

        let trading_mode = match optional_env("TRADING_MODE")
            .unwrap_or_else(|| "replay".to_string())
            .to_lowercase()
            .as_str()
        {
            "replay" => TradingMode::Replay,
            "paper" => TradingMode::Paper,
            other => {
                return Err(Error::Config(format!(
                    "TRADING_MODE must be 'replay' or 'paper', got: '{other}'"
                )))
            }
        };

        Ok(Config {
            trading_mode,
            engine_config_path: optional_env("ENGINE_CONFIG_PATH")
                .unwrap_or_else(|| "config/engine.toml".to_string()),
            bars_path: required_env("BARS_PATH")?,
            events_out_path: optional_env("EVENTS_OUT_PATH"),
            initial_equity: parsed_env("INITIAL_EQUITY", 10_000.0)?,
            paper_slippage_bps: parsed_env("PAPER_SLIPPAGE_BPS", 10.0)?,
        })
    }
}

fn required_env(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| {
        Error::Config(format!(
            "Required environment variable '{key}' is not set. Check your .env file."
        ))
    })
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn parsed_env(key: &str, default: f64) -> Result<f64> {
    match optional_env(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{key} must be a number, got: '{raw}'"))),
    }
}
