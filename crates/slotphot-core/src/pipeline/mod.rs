pub mod background;
pub mod config;
pub mod convergence;
pub mod deep;
pub mod fit;
mod orchestrator;
mod types;

pub use config::{BackgroundConfig, ConvergenceConfig, PipelineConfig, SamplingConfig};
pub use convergence::{ConvergencePolicy, FixedRounds, GofStabilized};
pub use deep::{DeepContext, DeepDetection};
pub use orchestrator::run_pipeline;
pub use types::{NoOpReporter, PipelineStage, PipelineSummary, ProgressReporter, RoundReport};
