pub mod config;
pub mod manager;
pub mod state;

pub use config::{CollisionPolicy, RiskConfig, TrailingConfig};
pub use manager::PositionManager;
pub use state::RiskState;
