use std::ops::Range;
use std::time::Instant;

use tracing::{debug, info};

use crate::error::Result;
use crate::exec::{TaskExecutor, WorkerPool};
use crate::model::{KnotMode, Knots, Minimizer, Models};
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::fit::{clear_rows, fit_image, write_fit_row, write_residual_row, FitContext};
use crate::pipeline::types::{PipelineStage, ProgressReporter};
use crate::stack::ImageSampler;
use crate::tracking::{Offset, Tracker};
use crate::workspace::{ModellingBuffers, SharedArray, WorkspaceLayout};

/// Resources of the full-cube pass.
pub struct CubeContext<'a> {
    pub pool: &'a WorkerPool,
    pub executor: &'a TaskExecutor,
    pub sampler: &'a ImageSampler<'a>,
    pub buffers: &'a ModellingBuffers,
    pub config: &'a PipelineConfig,
}

/// Buffer layout of the full-cube pass for `n_frames` frames.
pub fn cube_layout(n_frames: usize, models: &Models, config: &PipelineConfig) -> WorkspaceLayout {
    let n_comb = config.sampling.n_comb.max(1);
    WorkspaceLayout::FullCube {
        n_frames,
        n_blocks: n_frames.div_ceil(n_comb),
        frame_shape: models.background.frame_shape(),
        dof: models.background.dof(),
        n_knots: models.background.knots().len(),
        n_streaks: models.bleed.n_streaks(),
        ftb_width: models.bleed.width,
    }
}

/// Offset to start an interval from: the offset of the sample whose frames
/// contain `frame`, else the nearest known sample offset.
fn initial_offset(frame: usize, samples: &[(Range<usize>, Offset)]) -> [f64; 2] {
    if let Some(o) = samples
        .iter()
        .find(|(r, _)| r.contains(&frame))
        .and_then(|(_, o)| *o)
    {
        return o;
    }
    samples
        .iter()
        .filter_map(|(r, o)| o.map(|o| (r.start.abs_diff(frame), o)))
        .min_by_key(|(d, _)| *d)
        .map(|(_, o)| o)
        .unwrap_or([0.0, 0.0])
}

/// Fit every block of `blocks` in order, writing per-frame residuals and
/// returning the per-frame offsets measured on them.
///
/// Each block fit counts as one task of `ctx.executor`. The frames of a
/// failed block get NaN residuals and unknown offsets.
fn model_interval(
    ctx: &CubeContext<'_>,
    fit_ctx: FitContext<'_>,
    blocks: Range<usize>,
    mut offset: [f64; 2],
    reporter: &dyn ProgressReporter,
) -> Result<Vec<Offset>> {
    let n_comb = ctx.config.sampling.n_comb.max(1);
    let n_frames = ctx.sampler.cube_len();
    let every = ctx.config.background.knot_search_every.max(1);

    let mut offsets = Vec::new();
    let mut knots: Option<Knots> = None;
    let mut params: Option<Vec<f64>> = None;
    let mut since_search = 0;

    for b in blocks {
        let frames = b * n_comb..((b + 1) * n_comb).min(n_frames);
        let image = ctx.sampler.block(&frames)?;
        let start = fit_ctx.tracker.start_for(offset);

        let mode = match &knots {
            None => KnotMode::Guess,
            Some(_) if since_search >= every => KnotMode::Optimize,
            Some(k) => KnotMode::Fixed(k.clone()),
        };
        let minimizer = match params {
            Some(_) => Minimizer::levenberg_marquardt(),
            None => Minimizer::robust(),
        };
        let fitted = ctx.executor.execute(b, || {
            fit_image(fit_ctx, &image.view(), start, &mode, &minimizer, params.as_deref())
        })?;
        reporter.advance(frames.len());

        // A failed block keeps the knots, coefficients and offset of the
        // last good one.
        let Some(out) = fitted else {
            clear_rows(ctx.buffers, b, frames.clone())?;
            offsets.extend(vec![None; frames.len()]);
            continue;
        };
        if !matches!(mode, KnotMode::Fixed(_)) {
            since_search = 0;
        }
        write_fit_row(ctx.buffers, b, &out)?;

        let model = fit_ctx.model.with_knots(out.knots.clone())?;
        let surface = model.evaluate(&out.params);
        let objects = fit_ctx.tracker.get_segments(start, surface.dim());
        for f in frames.clone() {
            let mut residual = ctx.sampler.frame(f)? - &surface;
            let bleed = fit_ctx.bleed.fit_subtract(&mut residual, &objects, start);
            write_residual_row(ctx.buffers, f, &residual, &bleed)?;
        }

        let measured = fit_ctx
            .tracker
            .measure_offsets(frames.clone(), &ctx.buffers.residuals, offset)?;
        if let Some(last) = measured.iter().rev().find_map(|o| *o) {
            offset = last;
        }
        debug!(block = b, gof = out.gof, offset = ?offset, "Block modelled");
        offsets.extend(measured);

        since_search += frames.len();
        knots = Some(out.knots);
        params = Some(out.params);
    }
    Ok(offsets)
}

/// Model the background of every frame and track the camera on the
/// residuals. The tracker's offsets become per frame.
///
/// `samples` pairs each sample's frame interval with its offset. Returns
/// how many frames have a known offset afterwards.
pub fn full_cube_pass(
    ctx: &CubeContext<'_>,
    tracker: &mut Tracker,
    models: &Models,
    samples: &[(Range<usize>, Offset)],
    reporter: &dyn ProgressReporter,
) -> Result<usize> {
    let started = Instant::now();
    let n_frames = ctx.sampler.cube_len();
    let n_comb = ctx.config.sampling.n_comb.max(1);
    let n_blocks = n_frames.div_ceil(n_comb);
    let intervals = ImageSampler::intervals(0..n_blocks, ctx.pool.n_workers());
    reporter.begin_stage(PipelineStage::FullCube, Some(n_frames));
    ctx.executor.reset();

    // Per-frame offsets start unknown and are filled from the residuals.
    tracker.init_offsets(n_frames);
    let results: Vec<Result<Vec<Offset>>> = {
        let view: &Tracker = tracker;
        let fit_ctx = FitContext {
            model: &models.background,
            bleed: &models.bleed,
            tracker: view,
            search: &ctx.config.background.knot_search,
        };
        ctx.pool.map(&intervals, |blocks| {
            let offset = initial_offset(blocks.start * n_comb, samples);
            model_interval(ctx, fit_ctx, blocks.clone(), offset, reporter)
        })
    };
    ctx.executor.log_report();
    ctx.buffers.flush()?;

    for (blocks, measured) in intervals.iter().zip(results) {
        tracker.set_offsets(blocks.start * n_comb, &measured?)?;
    }
    let recovered = retrack_gaps(tracker, &ctx.buffers.residuals)?;
    let tracked = tracker.offsets().iter().filter(|o| o.is_some()).count();
    reporter.finish_stage();
    info!(
        frames = n_frames,
        blocks = n_blocks,
        tracked,
        recovered,
        failed_blocks = ctx.executor.failures(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Full cube modelled"
    );
    Ok(tracked)
}

/// Track every run of unknown frame offsets again, starting from the last
/// tracked frame before it. Returns how many frames were recovered.
fn retrack_gaps(tracker: &mut Tracker, residuals: &SharedArray<f64>) -> Result<usize> {
    let mut gaps = Vec::new();
    let offsets = tracker.offsets();
    let mut i = 0;
    while i < offsets.len() {
        if offsets[i].is_some() {
            i += 1;
            continue;
        }
        let first = i;
        while i < offsets.len() && offsets[i].is_none() {
            i += 1;
        }
        gaps.push(first..i);
    }

    let mut recovered = 0;
    for gap in gaps {
        recovered += tracker.track_loop(gap, residuals)?;
    }
    Ok(recovered)
}
