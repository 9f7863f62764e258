mod common;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use slotphot_core::exec::{FailureCap, TaskExecutor, WorkerPool};
use slotphot_core::model::{BackgroundModel, Models};
use slotphot_core::pipeline::convergence::round_gof;
use slotphot_core::pipeline::{
    ConvergenceConfig, ConvergencePolicy, DeepContext, DeepDetection, FixedRounds, GofStabilized,
    NoOpReporter, PipelineConfig, RoundReport,
};
use slotphot_core::segmentation::detect_measure;
use slotphot_core::tracking::{seed_tracker, Tracker, TrackerStage};
use slotphot_core::workspace::{ModellingBuffers, SharedArray, Workspace, WorkspaceLayout};

use common::{synthetic_frame, NOISE};

const SHAPE: (usize, usize) = (48, 48);

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.background.orders_y = vec![2];
    config.background.orders_x = vec![2];
    config.failure_cap = FailureCap::Unlimited;
    config
}

// ---------------------------------------------------------------------------
// Deep detection rounds
// ---------------------------------------------------------------------------

/// Seeded tracker, models and buffers for four shifted sample images.
struct Fixture {
    config: PipelineConfig,
    tracker: Tracker,
    models: Models,
    stack: SharedArray<f64>,
    buffers: ModellingBuffers,
    pool: WorkerPool,
    executor: TaskExecutor,
    indices: Vec<usize>,
    _dir: tempfile::TempDir,
}

impl Fixture {
    fn new(seed: u64) -> Self {
        let config = config();
        let shifts = [[0.0, 0.0], [1.0, 2.0], [-1.0, 0.0], [2.0, -1.0]];
        let mut rng = StdRng::seed_from_u64(seed);
        let images: Vec<Array2<f64>> = shifts
            .iter()
            .map(|d| synthetic_frame(SHAPE, [24.0 + d[0], 20.0 + d[1]], &mut rng))
            .collect();
        let measurements: Vec<_> = images
            .iter()
            .map(|im| detect_measure(&im.view(), None, &config.detection))
            .collect();
        let views: Vec<_> = images.iter().map(|im| im.view()).collect();
        let seeded = seed_tracker(&measurements, &views, &config.tracking).unwrap();
        let models = Models {
            background: BackgroundModel::new(SHAPE, config.background.orders()).unwrap(),
            bleed: seeded.bleed,
        };

        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path().join("modelling")).unwrap();
        let stack: SharedArray<f64> = ws
            .allocate("images", &[images.len(), SHAPE.0, SHAPE.1], f64::NAN, true)
            .unwrap();
        for (i, im) in images.iter().enumerate() {
            let flat: Vec<f64> = im.iter().copied().collect();
            stack.write_row(i, &flat).unwrap();
        }
        let layout = WorkspaceLayout::SampleFit {
            n_samples: images.len(),
            frame_shape: SHAPE,
            dof: models.background.dof(),
            n_knots: models.background.knots().len(),
            n_streaks: models.bleed.n_streaks(),
            ftb_width: models.bleed.width,
        };
        let buffers = ModellingBuffers::allocate(&ws, layout, true).unwrap();

        Self {
            executor: TaskExecutor::new("sample-fit", images.len(), config.failure_cap),
            indices: (0..images.len()).collect(),
            pool: WorkerPool::new(2).unwrap(),
            config,
            tracker: seeded.tracker,
            models,
            stack,
            buffers,
            _dir: dir,
        }
    }

    fn run(&mut self, rounds: usize) -> (DeepDetection, Vec<RoundReport>) {
        let ctx = DeepContext {
            pool: &self.pool,
            executor: &self.executor,
            images: &self.stack,
            buffers: &self.buffers,
            indices: &self.indices,
            config: &self.config,
        };
        let mut deep = DeepDetection::new();
        let reports = deep
            .run(
                &ctx,
                &mut self.tracker,
                &mut self.models,
                &FixedRounds(rounds),
                &NoOpReporter,
            )
            .unwrap();
        (deep, reports)
    }
}

#[test]
fn test_history_grows_one_entry_per_round() {
    let mut fx = Fixture::new(21);
    let ctx = DeepContext {
        pool: &fx.pool,
        executor: &fx.executor,
        images: &fx.stack,
        buffers: &fx.buffers,
        indices: &fx.indices,
        config: &fx.config,
    };
    let mut deep = DeepDetection::new();
    let mut reports = Vec::new();
    for round in 0..2 {
        let report = deep
            .round(&ctx, &mut fx.tracker, &mut fx.models, &NoOpReporter)
            .unwrap();
        assert_eq!(report.round, round);
        assert_eq!(deep.count, round);
        assert_eq!(deep.gof_history.len(), deep.count + 1);
        reports.push(report);
    }

    assert_eq!(deep.completed(), 2);
    for (round, gof) in deep.gof_history.iter().enumerate() {
        assert_eq!(gof.len(), fx.indices.len(), "round {round}");
        let median = round_gof(gof);
        assert!((median / (NOISE * NOISE) - 1.0).abs() < 0.3, "round {round}: {median}");
    }
    assert_eq!(deep.contributors, fx.indices);
    assert_eq!(fx.tracker.stage(), TrackerStage::DeepRefined);
    assert_eq!(reports[1].n_bright, 1);
    assert_eq!(fx.tracker.groups.bright().len(), 1);
    assert_eq!(fx.models.bleed.n_streaks(), 1);
    assert!(fx.buffers.gof_values().iter().all(|g| g.is_finite()));
}

#[test]
fn test_run_stops_after_fixed_rounds() {
    let mut fx = Fixture::new(23);
    let (deep, reports) = fx.run(3);
    assert_eq!(reports.len(), 3);
    assert_eq!(deep.count, 2);
    assert_eq!(deep.completed(), 3);
    assert_eq!(deep.gof_history.len(), deep.count + 1);
}

#[test]
fn test_blank_sample_fails_and_is_not_combined() {
    let mut fx = Fixture::new(22);
    // The tracker knows where sample 2 sits, but its pixels are gone.
    let blank = vec![f64::NAN; SHAPE.0 * SHAPE.1];
    fx.stack.write_row(2, &blank).unwrap();
    assert!(fx.tracker.start(2).is_some());

    let (deep, reports) = fx.run(1);

    assert_eq!(fx.executor.failures(), 1);
    assert_eq!(fx.executor.successes(), 3);
    assert_eq!(reports[0].n_failed(), 1);
    assert!(reports[0].gof[2].1.is_nan());
    assert_eq!(deep.contributors, vec![0, 1, 3]);
    assert_eq!(reports[0].n_bright, 1);
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

#[test]
fn test_gof_stabilized_stops_at_budget() {
    let policy = GofStabilized {
        epsilon: 1e-6,
        patience: 3,
        max_rounds: 3,
    };
    let history = vec![vec![4.0], vec![2.0], vec![1.0]];
    assert!(policy.should_stop(&history));
    assert!(!policy.should_stop(&history[..2]));
}

#[test]
fn test_failed_fits_do_not_count() {
    let policy = GofStabilized {
        epsilon: 1e-2,
        patience: 1,
        max_rounds: 10,
    };
    let history = vec![vec![1.0, f64::NAN, 3.0], vec![2.0, 2.0, f64::NAN]];
    assert_eq!(round_gof(&history[0]), 2.0);
    assert!(policy.should_stop(&history));
}

#[test]
fn test_config_builds_policy() {
    let fixed = ConvergenceConfig::FixedRounds { rounds: 3 }.policy();
    assert_eq!(fixed.max_rounds(), 3);
    let stable = ConvergenceConfig::default().policy();
    assert!(stable.max_rounds() >= 1);
    assert!(!stable.should_stop(&[]));
}
