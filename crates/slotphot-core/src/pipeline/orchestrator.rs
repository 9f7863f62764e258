use std::ops::Range;
use std::time::Instant;

use ndarray::Array2;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::exec::{successful, TaskExecutor, WorkerPool};
use crate::io::persist::{
    check_resume_compatibility, load_state, save_state, start_indices, PersistedState, StatePaths,
};
use crate::io::ImageCube;
use crate::model::{guess_knots, BackgroundModel, Models};
use crate::pipeline::background::{cube_layout, full_cube_pass, CubeContext};
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::deep::{DeepContext, DeepDetection};
use crate::pipeline::types::{PipelineStage, PipelineSummary, ProgressReporter, RoundReport};
use crate::segmentation::{detect_measure, Measurement};
use crate::stack::ImageSampler;
use crate::tracking::seed::crop_window;
use crate::tracking::{seed_tracker, Offset, Tracker};
use crate::workspace::{ModellingBuffers, SharedArray, Workspace, WorkspaceLayout};

/// Task executors of the three batch kinds, kept for the final report.
struct Executors {
    sampling: TaskExecutor,
    fitting: TaskExecutor,
    cube: TaskExecutor,
}

impl Executors {
    fn new(config: &PipelineConfig) -> Self {
        Self {
            sampling: TaskExecutor::new("sampling", 0, config.failure_cap),
            fitting: TaskExecutor::new("sample-fit", 0, config.failure_cap),
            cube: TaskExecutor::new("full-cube", 0, config.failure_cap),
        }
    }
}

/// Run the pipeline on `cube`.
///
/// Any error stops dispatching; the worker pool is shut down and its final
/// counts are logged before the error is returned.
pub fn run_pipeline(
    cube: &ImageCube,
    config: &PipelineConfig,
    reporter: &dyn ProgressReporter,
) -> Result<PipelineSummary> {
    config.validate()?;
    let pool = WorkerPool::new(config.n_workers)?;
    let mut executors = Executors::new(config);

    let outcome = run_stages(cube, config, &pool, &mut executors, reporter);
    let all = [&executors.sampling, &executors.fitting, &executors.cube];
    match outcome {
        Ok(mut summary) => {
            summary.tasks = pool.shutdown(&all);
            Ok(summary)
        }
        Err(e) => {
            error!(error = %e, "Pipeline aborted; shutting down workers");
            pool.shutdown(&all);
            Err(e)
        }
    }
}

fn run_stages(
    cube: &ImageCube,
    config: &PipelineConfig,
    pool: &WorkerPool,
    executors: &mut Executors,
    reporter: &dyn ProgressReporter,
) -> Result<PipelineSummary> {
    let started = Instant::now();
    let n_frames = cube.len();
    let frame_shape = cube.frame_shape();
    let n_workers = pool.n_workers();
    let sampler = ImageSampler::new(cube, config.sampling.n_comb)
        .with_bad_columns(&config.sampling.bad_columns);
    let intervals = ImageSampler::intervals(0..n_frames, config.sampling.detect_per_worker * n_workers);
    let n_samples = intervals.len();
    info!(
        frames = n_frames,
        frame_shape = ?frame_shape,
        samples = n_samples,
        workers = n_workers,
        "Pipeline started"
    );

    // Saved state is validated before any buffer is touched.
    let paths = StatePaths::new(&config.results);
    let resumed = !config.clobber && paths.exist();
    let saved = if resumed {
        let state = load_state(&paths)?;
        check_resume_compatibility(&state, frame_shape, Some(n_samples))?;
        Some(state)
    } else {
        None
    };

    let sample_ws = Workspace::new(config.sample_folder())?;
    let have_images = sample_ws.buffer_path("images").exists();
    let images: SharedArray<f64> = sample_ws.allocate(
        "images",
        &[n_samples, frame_shape.0, frame_shape.1],
        f64::NAN,
        config.clobber,
    )?;

    executors.sampling.set_size(n_samples);
    let (mut tracker, mut models, run_rounds) = match saved {
        Some(state) => {
            let tracker = sample_tracker(state.tracker, &state.start_idx)?;
            if config.refine_on_resume && !have_images {
                create_samples(pool, &executors.sampling, &sampler, &intervals, &images, reporter)?;
            }
            info!(stage = ?tracker.stage(), refine = config.refine_on_resume, "Resuming from saved state");
            (tracker, state.models, config.refine_on_resume)
        }
        None => {
            let ok = create_samples(pool, &executors.sampling, &sampler, &intervals, &images, reporter)?;
            let (tracker, models) = seed(pool, config, &sample_ws, &images, &ok, n_samples, reporter)?;
            (tracker, models, true)
        }
    };

    let mut rounds: Vec<RoundReport> = Vec::new();
    if run_rounds {
        let indices = fit_subset(&tracker, config.sampling.fit_per_worker * n_workers);
        executors.fitting.set_size(indices.len());
        let layout = WorkspaceLayout::SampleFit {
            n_samples,
            frame_shape,
            dof: models.background.dof(),
            n_knots: models.background.knots().len(),
            n_streaks: models.bleed.n_streaks(),
            ftb_width: models.bleed.width,
        };
        // The streak count of a resumed model differs from the stored layout.
        let modelling_ws = Workspace::new(config.sample_modelling_folder())?;
        let buffers = ModellingBuffers::allocate(&modelling_ws, layout, config.clobber || resumed)?;

        let ctx = DeepContext {
            pool,
            executor: &executors.fitting,
            images: &images,
            buffers: &buffers,
            indices: &indices,
            config,
        };
        let policy = config.convergence.policy();
        let mut deep = DeepDetection::new();
        rounds = deep.run(&ctx, &mut tracker, &mut models, policy.as_ref(), reporter)?;
        buffers.flush()?;
        tracker.freeze()?;
    }

    reporter.begin_stage(PipelineStage::Persisting, None);
    let mut state = PersistedState {
        start_idx: start_indices(&tracker),
        tracker,
        models,
    };
    save_state(&paths, &state)?;
    reporter.finish_stage();

    let mut tracked_frames = None;
    if config.full_cube_pass {
        let sample_offsets: Vec<(Range<usize>, Offset)> = intervals
            .iter()
            .cloned()
            .zip(state.tracker.offsets().iter().copied())
            .collect();
        let layout = cube_layout(n_frames, &state.models, config);
        let workspace = Workspace::new(config.modelling_folder())?;
        let buffers = ModellingBuffers::allocate(&workspace, layout, config.clobber)?;
        executors.cube.set_size(layout.fit_rows());
        let ctx = CubeContext {
            pool,
            executor: &executors.cube,
            sampler: &sampler,
            buffers: &buffers,
            config,
        };
        let tracked = full_cube_pass(&ctx, &mut state.tracker, &state.models, &sample_offsets, reporter)?;
        save_state(&paths, &state)?;
        tracked_frames = Some(tracked);
    }

    Ok(PipelineSummary {
        n_frames,
        n_samples,
        resumed,
        stage: state.tracker.stage(),
        rounds,
        n_objects: state.tracker.segm().n_labels(),
        n_bright: state.tracker.groups.bright().len(),
        tracked_frames,
        tasks: Vec::new(),
        elapsed: started.elapsed(),
    })
}

/// Build every sample image into `images`. Returns the samples that
/// succeeded.
fn create_samples(
    pool: &WorkerPool,
    executor: &TaskExecutor,
    sampler: &ImageSampler<'_>,
    intervals: &[Range<usize>],
    images: &SharedArray<f64>,
    reporter: &dyn ProgressReporter,
) -> Result<Vec<usize>> {
    reporter.begin_stage(PipelineStage::Sampling, Some(intervals.len()));
    executor.reset();
    let indices: Vec<usize> = (0..intervals.len()).collect();
    let results = pool.run_tasks(executor, &indices, |i| {
        let image = sampler.sample(&intervals[i])?;
        let flat: Vec<f64> = image.iter().copied().collect();
        images.write_row(i, &flat)?;
        reporter.advance(1);
        Ok(())
    })?;
    images.flush()?;
    executor.log_report();
    reporter.finish_stage();
    Ok(successful(&results))
}

/// Detect objects on the sample images, seed the tracker and initialise the
/// background model from the aligned mean.
fn seed(
    pool: &WorkerPool,
    config: &PipelineConfig,
    sample_ws: &Workspace,
    images: &SharedArray<f64>,
    ok: &[usize],
    n_samples: usize,
    reporter: &dyn ProgressReporter,
) -> Result<(Tracker, Models)> {
    let (h, w) = (images.shape()[1], images.shape()[2]);
    reporter.begin_stage(PipelineStage::Detection, Some(ok.len()));
    let frames: Vec<Array2<f64>> = ok
        .iter()
        .map(|&i| images.read_image(i))
        .collect::<Result<_>>()?;
    let measurements: Vec<Measurement> = pool.map(&frames, |image| {
        let m = detect_measure(&image.view(), None, &config.detection);
        reporter.advance(1);
        m
    });
    let segmentations: SharedArray<u32> =
        sample_ws.allocate("segmentations", &[n_samples, h, w], 0u32, config.clobber)?;
    for (&i, m) in ok.iter().zip(&measurements) {
        let flat: Vec<u32> = m.segm.data().iter().copied().collect();
        segmentations.write_row(i, &flat)?;
    }
    segmentations.flush()?;
    reporter.finish_stage();

    reporter.begin_stage(PipelineStage::Seeding, None);
    let views: Vec<_> = frames.iter().map(|f| f.view()).collect();
    let seeded = seed_tracker(&measurements, &views, &config.tracking)?;
    let reference_start = seeded
        .tracker
        .start(seeded.reference_index)
        .unwrap_or([0, 0]);

    // Offsets are per sample; failed samples stay unknown.
    let mut tracker = seeded.tracker;
    let mut offsets: Vec<Offset> = vec![None; n_samples];
    for (k, &i) in ok.iter().enumerate() {
        offsets[i] = tracker.offset(k);
    }
    tracker.init_offsets(n_samples);
    tracker.set_offsets(0, &offsets)?;

    let mean = crop_window(&seeded.mean.image.view(), reference_start, (h, w));
    let objects = tracker.get_segments(reference_start, (h, w));
    let mut background = BackgroundModel::new((h, w), config.background.orders())?;
    let knots = guess_knots(&background, &mean.view(), &objects);
    background.set_knots(knots, false)?;
    background.restrict_corners(config.background.corner_degree);
    info!(
        knots = ?background.knots(),
        dof = background.dof(),
        free = background.n_free(),
        "Background model initialised"
    );
    reporter.finish_stage();

    Ok((
        tracker,
        Models {
            background,
            bleed: seeded.bleed,
        },
    ))
}

/// Restore per-sample offsets from stored window starts.
fn sample_tracker(mut tracker: Tracker, start_idx: &[Option<[i64; 2]>]) -> Result<Tracker> {
    let zp = tracker.zero_point();
    let offsets: Vec<Offset> = start_idx
        .iter()
        .map(|s| s.map(|[y, x]| [zp[0] - y as f64, zp[1] - x as f64]))
        .collect();
    tracker.init_offsets(offsets.len());
    tracker.set_offsets(0, &offsets)?;
    Ok(tracker)
}

/// Up to `n` samples with known offsets, evenly spread.
fn fit_subset(tracker: &Tracker, n: usize) -> Vec<usize> {
    let known: Vec<usize> = tracker
        .offsets()
        .iter()
        .enumerate()
        .filter_map(|(i, o)| o.map(|_| i))
        .collect();
    if known.len() < tracker.offsets().len() {
        warn!(
            unknown = tracker.offsets().len() - known.len(),
            "Samples without a camera offset are not fitted"
        );
    }
    if n == 0 || known.len() <= n {
        return known;
    }
    (0..n).map(|k| known[k * known.len() / n]).collect()
}
