use std::ops::Range;

use ndarray::{Array2, ArrayView2};
use tracing::debug;

use crate::error::{FitError, Result};
use crate::model::{
    resolve_knots, BackgroundModel, FrameTransferBleed, KnotMode, KnotSearch, Knots, Minimizer,
};
use crate::tracking::Tracker;
use crate::workspace::ModellingBuffers;

/// Shared, read-only state seen by every fit worker of a batch.
#[derive(Clone, Copy)]
pub struct FitContext<'a> {
    pub model: &'a BackgroundModel,
    pub bleed: &'a FrameTransferBleed,
    pub tracker: &'a Tracker,
    pub search: &'a KnotSearch,
}

/// Fitted background of one image.
#[derive(Clone, Debug)]
pub struct FitOutput {
    pub params: Vec<f64>,
    pub knots: Knots,
    pub gof: f64,
    /// Image minus background and bleed.
    pub residual: Array2<f64>,
    /// `(n_streaks, width)` bleed levels.
    pub bleed: Array2<f64>,
}

/// Fit the background and bleed of `image`, seen through the tracker
/// window at `start`.
///
/// Tracker objects in the window are excluded from the surface fit. Knot
/// search failures are returned like any other fit failure.
pub fn fit_image(
    ctx: FitContext<'_>,
    image: &ArrayView2<f64>,
    start: [isize; 2],
    mode: &KnotMode,
    minimizer: &Minimizer,
    p0: Option<&[f64]>,
) -> Result<FitOutput> {
    let objects = ctx.tracker.get_segments(start, image.dim());
    let knots = resolve_knots(mode, ctx.model, image, &objects, ctx.search)?;
    let model = ctx.model.with_knots(knots.clone())?;
    let fit = model.fit(image, &objects, minimizer, p0)?;
    if !fit.gof.is_finite() {
        return Err(FitError::NonFinite.into());
    }

    let mut residual = model.residuals(image, &fit.params);
    let bleed = ctx.bleed.fit_subtract(&mut residual, &objects, start);
    debug!(
        gof = fit.gof,
        n_fit = fit.n_fit,
        minimizer = minimizer.name(),
        "Image fitted"
    );
    Ok(FitOutput {
        params: fit.params,
        knots,
        gof: fit.gof,
        residual,
        bleed,
    })
}

/// Store the fit-row quantities of `out` at `fit_row`.
pub fn write_fit_row(buffers: &ModellingBuffers, fit_row: usize, out: &FitOutput) -> Result<()> {
    buffers.params.write_row(fit_row, &out.params)?;
    buffers.knots.write_row(fit_row, &out.knots.to_row())?;
    buffers.gof.set(fit_row, out.gof)
}

/// Store a residual image and its bleed levels at `row`.
pub fn write_residual_row(
    buffers: &ModellingBuffers,
    row: usize,
    residual: &Array2<f64>,
    bleed: &Array2<f64>,
) -> Result<()> {
    let flat: Vec<f64> = residual.iter().copied().collect();
    buffers.residuals.write_row(row, &flat)?;
    let levels: Vec<f64> = bleed.iter().copied().collect();
    buffers.bleeding.write_row(row, &levels)
}

/// Mark fit row `fit_row` and residual rows `frames` as not modelled.
pub fn clear_rows(buffers: &ModellingBuffers, fit_row: usize, frames: Range<usize>) -> Result<()> {
    buffers.params.write_row(fit_row, &vec![f64::NAN; buffers.params.row_len()])?;
    buffers.gof.set(fit_row, f64::NAN)?;
    let blank = vec![f64::NAN; buffers.residuals.row_len()];
    let no_bleed = vec![f64::NAN; buffers.bleeding.row_len()];
    for f in frames {
        buffers.residuals.write_row(f, &blank)?;
        buffers.bleeding.write_row(f, &no_bleed)?;
    }
    Ok(())
}

/// Previous coefficients of `row`, if every value is finite.
pub fn stored_params(buffers: &ModellingBuffers, row: usize) -> Result<Option<Vec<f64>>> {
    let params = buffers.params.read_row(row)?;
    Ok((!params.is_empty() && params.iter().all(|v| v.is_finite())).then_some(params))
}

/// Knots stored at `row`, if a fit was recorded there.
pub fn stored_knots(buffers: &ModellingBuffers, row: usize, model: &BackgroundModel) -> Result<Option<Knots>> {
    let gof = buffers.gof.get(row).unwrap_or(f64::NAN);
    if !gof.is_finite() {
        return Ok(None);
    }
    let n_y = model.orders().y.len().saturating_sub(1);
    let n_x = model.orders().x.len().saturating_sub(1);
    let row = buffers.knots.read_row(row)?;
    Ok(Knots::from_row(&row, n_y, n_x).filter(|k| model.validate_knots(k).is_ok()))
}
