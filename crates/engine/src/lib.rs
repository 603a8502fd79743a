pub mod config;
pub mod live;
pub mod metrics;
pub mod pipeline;
pub mod replay;

pub use config::{EngineConfig, ReplayConfig};
pub use live::{BarReport, LiveDriver};
pub use metrics::{PerformanceSummary, TradeOutcome};
pub use pipeline::{DecisionCore, Evaluation, PendingAction, SymbolBook};
pub use replay::{run, ReplayEngine, ReplayReport};
