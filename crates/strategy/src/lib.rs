pub mod config;
pub mod extractor;
pub mod indicators;
pub mod model;
pub mod scorer;

pub use config::{Bias, FlagWeight, LadderStep, ScorerConfig, Thresholds};
pub use extractor::{ExtractorConfig, StructureExtractor};
pub use model::{LogisticModel, ModelConfig};
pub use scorer::{score, SignalScorer};

use common::{Bar, FeatureVector};
use thiserror::Error;

/// Failure to produce features or a confidence value for one symbol on one
/// bar. The caller skips that bar and records a coverage gap.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeatureError {
    #[error("insufficient history: need {needed} bars, got {got}")]
    InsufficientHistory { needed: usize, got: usize },

    #[error("malformed input window: {0}")]
    Malformed(String),

    #[error("non-finite value for '{0}'")]
    NonFinite(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
}

/// Turns a window of bars into an indicator read-out.
///
/// Must be a pure function of `window` (oldest first, newest last). The
/// returned vector's timestamp must be that of the newest bar it used.
pub trait FeatureExtractor: Send + Sync {
    /// Minimum window length the extractor needs.
    fn warmup(&self) -> usize;

    fn extract(&self, window: &[Bar]) -> Result<FeatureVector, FeatureError>;
}

/// Maps a feature vector to a confidence in `[0, 1]`. Pure; training is
/// someone else's job.
pub trait ConfidenceModel: Send + Sync {
    fn predict(&self, features: &FeatureVector) -> Result<f64, FeatureError>;
}
