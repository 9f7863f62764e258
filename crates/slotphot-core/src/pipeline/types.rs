use std::fmt;
use std::time::Duration;

use crate::exec::TaskReport;
use crate::tracking::TrackerStage;

/// Pipeline processing stage, used for progress reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStage {
    Sampling,
    Detection,
    Seeding,
    DeepDetection { round: usize },
    FullCube,
    Persisting,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sampling => write!(f, "Creating sample images"),
            Self::Detection => write!(f, "Detecting objects"),
            Self::Seeding => write!(f, "Seeding tracker"),
            Self::DeepDetection { round } => write!(f, "Deep detection round {round}"),
            Self::FullCube => write!(f, "Modelling full cube"),
            Self::Persisting => write!(f, "Saving state"),
        }
    }
}

/// Thread-safe progress reporting for the pipeline.
///
/// Implementors can use this to drive progress bars, logging, or any other
/// UI feedback. All methods have default no-op implementations.
pub trait ProgressReporter: Send + Sync {
    /// A new pipeline stage has started. `total_items` is the number of
    /// work items in this stage, if known.
    fn begin_stage(&self, _stage: PipelineStage, _total_items: Option<usize>) {}

    /// One work item within the current stage has completed.
    fn advance(&self, _items_done: usize) {}

    /// The current stage is finished.
    fn finish_stage(&self) {}
}

pub struct NoOpReporter;
impl ProgressReporter for NoOpReporter {}

/// Outcome of one deep detection round.
#[derive(Clone, Debug)]
pub struct RoundReport {
    pub round: usize,
    /// `(sample index, gof)` for every sample fitted this round; NaN marks
    /// a failed fit.
    pub gof: Vec<(usize, f64)>,
    pub n_objects: usize,
    pub n_bright: usize,
    pub elapsed: Duration,
}

impl RoundReport {
    pub fn n_failed(&self) -> usize {
        self.gof.iter().filter(|(_, g)| !g.is_finite()).count()
    }
}

/// What a pipeline run produced.
#[derive(Clone, Debug)]
pub struct PipelineSummary {
    pub n_frames: usize,
    pub n_samples: usize,
    pub resumed: bool,
    pub stage: TrackerStage,
    pub rounds: Vec<RoundReport>,
    pub n_objects: usize,
    pub n_bright: usize,
    /// Frames whose camera offset is known after the full-cube pass.
    pub tracked_frames: Option<usize>,
    pub tasks: Vec<TaskReport>,
    pub elapsed: Duration,
}
