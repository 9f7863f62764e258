use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::consts::{
    DEFAULT_DETECT_PER_WORKER, DEFAULT_FIT_PER_WORKER, DEFAULT_GOF_EPSILON,
    DEFAULT_GOF_PATIENCE, DEFAULT_KNOT_SEARCH_EVERY, DEFAULT_MAX_FAIL_FRACTION,
    DEFAULT_MAX_ROUNDS, DEFAULT_N_COMB, DEFAULT_ORDERS_X, DEFAULT_ORDERS_Y,
};
use crate::error::{PhotError, Result};
use crate::exec::FailureCap;
use crate::model::{KnotSearch, SplineOrders};
use crate::pipeline::convergence::{ConvergencePolicy, FixedRounds, GofStabilized};
use crate::segmentation::DetectionConfig;
use crate::tracking::TrackingConfig;

/// Everything the pipeline needs besides the cube itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Folder holding the workspace buffers and persisted state.
    pub results: PathBuf,
    /// Failures tolerated per batch, e.g. `"30%"`, `"5"` or `"none"`.
    pub failure_cap: FailureCap,
    /// Worker threads; 0 uses every available core.
    pub n_workers: usize,
    /// Recreate buffers and ignore persisted state.
    pub clobber: bool,
    /// Frame range `[start, stop)` to process.
    pub subset: Option<[usize; 2]>,
    /// Channel to read from a 4-D cube.
    pub channel: Option<usize>,
    /// Run further detection rounds on top of a resumed tracker.
    pub refine_on_resume: bool,
    /// Model every frame after the sample rounds converge.
    pub full_cube_pass: bool,
    pub sampling: SamplingConfig,
    pub detection: DetectionConfig,
    pub tracking: TrackingConfig,
    pub background: BackgroundConfig,
    pub convergence: ConvergenceConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            results: PathBuf::from("results"),
            sampling: SamplingConfig::default(),
            detection: DetectionConfig::default(),
            tracking: TrackingConfig::default(),
            background: BackgroundConfig::default(),
            convergence: ConvergenceConfig::default(),
            failure_cap: FailureCap::Fraction(DEFAULT_MAX_FAIL_FRACTION),
            n_workers: 0,
            clobber: false,
            subset: None,
            channel: None,
            refine_on_resume: false,
            full_cube_pass: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Frames combined into one sample image.
    pub n_comb: usize,
    /// Sample images per worker used for detection.
    pub detect_per_worker: usize,
    /// Sample images per worker fitted in each detection round.
    pub fit_per_worker: usize,
    /// Detector columns masked in every image.
    pub bad_columns: Vec<usize>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            n_comb: DEFAULT_N_COMB,
            detect_per_worker: DEFAULT_DETECT_PER_WORKER,
            fit_per_worker: DEFAULT_FIT_PER_WORKER,
            bad_columns: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Polynomial order of each row segment.
    pub orders_y: Vec<usize>,
    /// Polynomial order of each column segment.
    pub orders_x: Vec<usize>,
    /// Frames between knot searches in the full-cube pass.
    pub knot_search_every: usize,
    /// Highest total degree kept in the corner regions.
    pub corner_degree: usize,
    pub knot_search: KnotSearch,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            orders_y: DEFAULT_ORDERS_Y.to_vec(),
            orders_x: DEFAULT_ORDERS_X.to_vec(),
            knot_search_every: DEFAULT_KNOT_SEARCH_EVERY,
            knot_search: KnotSearch::default(),
            corner_degree: 2,
        }
    }
}

impl BackgroundConfig {
    pub fn orders(&self) -> SplineOrders {
        SplineOrders {
            y: self.orders_y.clone(),
            x: self.orders_x.clone(),
        }
    }
}

/// When the deep detection loop stops.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ConvergenceConfig {
    /// Always run exactly this many rounds.
    FixedRounds { rounds: usize },
    /// Stop once the median goodness of fit changes by less than `epsilon`
    /// (relative) for `patience` consecutive rounds.
    GofStabilized {
        epsilon: f64,
        patience: usize,
        max_rounds: usize,
    },
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self::GofStabilized {
            epsilon: DEFAULT_GOF_EPSILON,
            patience: DEFAULT_GOF_PATIENCE,
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }
}

impl ConvergenceConfig {
    pub fn policy(&self) -> Box<dyn ConvergencePolicy> {
        match *self {
            Self::FixedRounds { rounds } => Box::new(FixedRounds(rounds)),
            Self::GofStabilized {
                epsilon,
                patience,
                max_rounds,
            } => Box::new(GofStabilized {
                epsilon,
                patience,
                max_rounds,
            }),
        }
    }
}

impl PipelineConfig {
    /// Read a TOML configuration file. Missing fields take their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| PhotError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| PhotError::Config(e.to_string()))
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(PhotError::Config(msg.to_string()));
        if self.sampling.n_comb == 0 {
            return fail("n_comb must be at least 1");
        }
        if self.sampling.detect_per_worker == 0 || self.sampling.fit_per_worker == 0 {
            return fail("samples per worker must be at least 1");
        }
        if self.background.orders_y.is_empty() || self.background.orders_x.is_empty() {
            return fail("spline orders must name at least one segment per axis");
        }
        if self.detection.npixels.is_empty() {
            return fail("detection needs at least one tier");
        }
        if !(0.0..=1.0).contains(&self.tracking.merge_accept) {
            return fail("merge_accept must lie in [0, 1]");
        }
        if self.tracking.ftb_width == 0 {
            return fail("ftb_width must be at least 1");
        }
        if let Some([start, stop]) = self.subset {
            if start >= stop {
                return Err(PhotError::Config(format!(
                    "empty frame subset [{start}, {stop})"
                )));
            }
        }
        Ok(())
    }

    pub fn subset_range(&self) -> Option<Range<usize>> {
        self.subset.map(|[start, stop]| start..stop)
    }

    pub fn detection_folder(&self) -> PathBuf {
        self.results.join("detection")
    }

    /// Sample images and their segmentations.
    pub fn sample_folder(&self) -> PathBuf {
        self.detection_folder().join("sample")
    }

    /// Workspace of the sample-fitting rounds.
    pub fn sample_modelling_folder(&self) -> PathBuf {
        self.detection_folder().join("modelling")
    }

    /// Workspace of the full-cube pass.
    pub fn modelling_folder(&self) -> PathBuf {
        self.results.join("modelling")
    }
}
