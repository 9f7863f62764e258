use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{debug, info};

use crate::error::{PhotError, Result};
use crate::exec::{successful, TaskExecutor, WorkerPool};
use crate::model::{KnotMode, KnotSearch, Minimizer, Models};
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::convergence::{round_gof, ConvergencePolicy};
use crate::pipeline::fit::{fit_image, stored_knots, stored_params, write_fit_row, write_residual_row, FitContext};
use crate::pipeline::types::{PipelineStage, ProgressReporter, RoundReport};
use crate::segmentation::detect_loop;
use crate::stack::{shift_combine, CombinedImage, Statistic};
use crate::tracking::{Groups, Tracker, TrackerStage};
use crate::workspace::{ModellingBuffers, SharedArray};

/// Resources one deep detection round works with.
pub struct DeepContext<'a> {
    pub pool: &'a WorkerPool,
    pub executor: &'a TaskExecutor,
    /// Sample images, one row per sample.
    pub images: &'a SharedArray<f64>,
    pub buffers: &'a ModellingBuffers,
    /// Samples fitted every round.
    pub indices: &'a [usize],
    pub config: &'a PipelineConfig,
}

/// Iterative refit and re-detection on the combined residual of the
/// sample images.
///
/// After every round `gof_history.len() == count + 1`.
#[derive(Debug, Default)]
pub struct DeepDetection {
    /// Index of the last completed round.
    pub count: usize,
    pub gof_history: Vec<Vec<f64>>,
    /// Samples whose residual entered the last combination.
    pub contributors: Vec<usize>,
}

impl DeepDetection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed rounds.
    pub fn completed(&self) -> usize {
        self.gof_history.len()
    }

    /// Knot mode and minimizer of round `round` for sample `row`.
    ///
    /// Round 0 guesses knots and fits robustly. Round 1 searches knots and
    /// switches to Levenberg-Marquardt seeded with the previous
    /// coefficients. Later rounds keep the knots stored for the sample.
    fn policy(
        round: usize,
        ctx: &DeepContext<'_>,
        models: &Models,
        row: usize,
    ) -> Result<(KnotMode, Minimizer, Option<Vec<f64>>)> {
        if round == 0 {
            return Ok((KnotMode::Guess, Minimizer::robust(), None));
        }
        let p0 = stored_params(ctx.buffers, row)?;
        let mode = match (round, stored_knots(ctx.buffers, row, &models.background)?) {
            (1, _) | (_, None) => KnotMode::Optimize,
            (_, Some(knots)) => KnotMode::Fixed(knots),
        };
        Ok((mode, Minimizer::levenberg_marquardt(), p0))
    }

    /// Run one round: fit, combine, detect and update the tracker.
    pub fn round(
        &mut self,
        ctx: &DeepContext<'_>,
        tracker: &mut Tracker,
        models: &mut Models,
        reporter: &dyn ProgressReporter,
    ) -> Result<RoundReport> {
        let round = self.completed();
        let started = Instant::now();
        reporter.begin_stage(PipelineStage::DeepDetection { round }, Some(ctx.indices.len()));
        ctx.executor.reset();

        let search: &KnotSearch = &ctx.config.background.knot_search;
        let results = {
            let view: &Tracker = tracker;
            let models_view: &Models = models;
            let fit_ctx = FitContext {
                model: &models_view.background,
                bleed: &models_view.bleed,
                tracker: view,
                search,
            };
            ctx.pool.run_tasks(ctx.executor, ctx.indices, |i| {
                let start = view
                    .start(i)
                    .ok_or_else(|| PhotError::Config(format!("sample {i} has no known offset")))?;
                let image = ctx.images.read_image(i)?;
                let (mode, minimizer, p0) = Self::policy(round, ctx, models_view, i)?;
                let out = fit_image(fit_ctx, &image.view(), start, &mode, &minimizer, p0.as_deref())?;
                write_fit_row(ctx.buffers, i, &out)?;
                write_residual_row(ctx.buffers, i, &out.residual, &out.bleed)?;
                reporter.advance(1);
                Ok(out.gof)
            })?
        };
        ctx.executor.log_report();

        let ok: Vec<usize> = successful(&results)
            .into_iter()
            .map(|k| ctx.indices[k])
            .collect();
        let gof: Vec<(usize, f64)> = ctx
            .indices
            .iter()
            .zip(&results)
            .map(|(&i, r)| (i, r.unwrap_or(f64::NAN)))
            .collect();
        for (i, g) in &gof {
            debug!(round, sample = i, gof = g, "Sample fit");
        }

        let combined = self.combine_residuals(ctx, tracker, &ok)?;
        let (n_objects, n_bright) = update_tracker(&combined, tracker, models, ctx.config)?;
        tracker.transition(TrackerStage::DeepRefined)?;

        self.gof_history.push(gof.iter().map(|(_, g)| *g).collect());
        self.count = round;
        reporter.finish_stage();

        let report = RoundReport {
            round,
            gof,
            n_objects,
            n_bright,
            elapsed: started.elapsed(),
        };
        info!(
            round,
            fitted = ok.len(),
            failed = report.n_failed(),
            median_gof = round_gof(&self.gof_history[round]),
            objects = n_objects,
            bright = n_bright,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Deep detection round complete"
        );
        Ok(report)
    }

    /// Median of the residuals of `samples` on the extended frame.
    fn combine_residuals(
        &mut self,
        ctx: &DeepContext<'_>,
        tracker: &Tracker,
        samples: &[usize],
    ) -> Result<CombinedImage> {
        let images = samples
            .iter()
            .map(|&i| ctx.buffers.residuals.read_image(i))
            .collect::<Result<Vec<_>>>()?;
        let views: Vec<_> = images.iter().map(|im| im.view()).collect();
        let starts: Vec<_> = samples.iter().map(|&i| tracker.start(i)).collect();
        let combined = shift_combine(&views, &starts, tracker.extended_shape(), Statistic::Median)?;
        self.contributors = combined
            .contributors
            .iter()
            .map(|&k| samples[k])
            .collect();
        Ok(combined)
    }

    /// Rounds until `policy` is satisfied.
    pub fn run(
        &mut self,
        ctx: &DeepContext<'_>,
        tracker: &mut Tracker,
        models: &mut Models,
        policy: &dyn ConvergencePolicy,
        reporter: &dyn ProgressReporter,
    ) -> Result<Vec<RoundReport>> {
        let mut reports = Vec::new();
        while self.completed() < policy.max_rounds() && !policy.should_stop(&self.gof_history) {
            reports.push(self.round(ctx, tracker, models, reporter)?);
        }
        info!(rounds = self.completed(), "Deep detection finished");
        Ok(reports)
    }
}

/// Replace the tracker objects with detections on `combined`.
///
/// Tier groups hold the faint detections of each tier, objects above the
/// bright threshold go to the bright group and get bleed streaks. Returns
/// the object and bright counts.
fn update_tracker(
    combined: &CombinedImage,
    tracker: &mut Tracker,
    models: &mut Models,
    config: &PipelineConfig,
) -> Result<(usize, usize)> {
    let image = combined.image.view();
    let detected = detect_loop(&image, None, &config.detection)?;
    let background = detected.background.map(|(m, _)| m).unwrap_or(0.0);
    let above = combined.image.mapv(|v| v - background);

    let mut segm = detected.segm;
    let order = segm.count_sort(&above.view());
    let tiers: Vec<Vec<u32>> = detected.tiers.iter().map(|t| order.apply(t)).collect();

    let counts = segm.counts(&image, background);
    let n_objects = counts.len();
    let bright: Vec<u32> = counts
        .iter()
        .filter(|(_, c)| **c > config.tracking.bright_thresh_counts)
        .map(|(l, _)| *l)
        .collect();
    let centroids = segm.centroids(&above.view());
    let reference: BTreeMap<u32, [f64; 2]> = bright
        .iter()
        .filter_map(|&l| centroids.get(&l).map(|c| (l, [c.y, c.x])))
        .collect();
    let sources: Vec<(u32, f64)> = reference.iter().map(|(&l, p)| (l, p[1])).collect();
    let streaks = models.bleed.adapt_segments(&mut segm, &sources)?;

    tracker.reset_segments();
    let map = tracker.add_segments(segm.data())?;
    for (k, tier) in tiers.iter().enumerate() {
        let faint: Vec<u32> = tier.iter().copied().filter(|l| !bright.contains(l)).collect();
        tracker.groups.set(&format!("tier{k}"), map.apply(&faint));
    }
    tracker.groups.set(Groups::BRIGHT, map.apply(&bright));
    tracker.groups.set(Groups::STREAKS, map.apply(&streaks));
    tracker.set_reference(
        reference
            .into_iter()
            .map(|(l, p)| (map.get(l).unwrap_or(l), p))
            .collect(),
    );
    models.bleed.relabel(&map);
    Ok((n_objects, bright.len()))
}
