use std::ops::Range;

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FitError, Result};
use crate::model::solver::{LinearProblem, Minimizer};
use crate::segmentation::{LabelMap, SegmentationImage};
use crate::stats::nan_median;

/// Interior knot positions along each axis. Boundary knots are implicit at
/// 0 and the frame size.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Knots {
    pub y: Vec<usize>,
    pub x: Vec<usize>,
}

impl Knots {
    /// Evenly spaced knots for `ny` row segments and `nx` column segments.
    pub fn uniform(shape: (usize, usize), ny: usize, nx: usize) -> Self {
        let split = |len: usize, n: usize| (1..n).map(|k| k * len / n).collect::<Vec<_>>();
        Self {
            y: split(shape.0, ny.max(1)),
            x: split(shape.1, nx.max(1)),
        }
    }

    /// Segment boundaries along rows: `[0, y.., h]`.
    pub fn breaks_y(&self, h: usize) -> Vec<usize> {
        breaks(&self.y, h)
    }

    pub fn breaks_x(&self, w: usize) -> Vec<usize> {
        breaks(&self.x, w)
    }

    pub fn len(&self) -> usize {
        self.y.len() + self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty() && self.x.is_empty()
    }

    /// Flat form stored in the knots buffer: row knots then column knots.
    pub fn to_row(&self) -> Vec<i64> {
        self.y.iter().chain(&self.x).map(|&k| k as i64).collect()
    }

    /// Inverse of [`to_row`](Self::to_row). `None` if any value is negative
    /// or the row is too short.
    pub fn from_row(row: &[i64], n_y: usize, n_x: usize) -> Option<Self> {
        if row.len() < n_y + n_x || row.iter().any(|&v| v < 0) {
            return None;
        }
        Some(Self {
            y: row[..n_y].iter().map(|&v| v as usize).collect(),
            x: row[n_y..n_y + n_x].iter().map(|&v| v as usize).collect(),
        })
    }
}

fn breaks(interior: &[usize], len: usize) -> Vec<usize> {
    std::iter::once(0)
        .chain(interior.iter().copied())
        .chain(std::iter::once(len))
        .collect()
}

/// Polynomial order of each segment along each axis.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplineOrders {
    pub y: Vec<usize>,
    pub x: Vec<usize>,
}

/// Smallest segment length that can support a polynomial of `order`.
pub fn min_segment(order: usize) -> usize {
    order + 2
}

/// One rectangular region with its own polynomial.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub label: u32,
    pub rows: (usize, usize),
    pub cols: (usize, usize),
    pub order_y: usize,
    pub order_x: usize,
    /// Index of the first coefficient in the parameter vector.
    pub offset: usize,
    /// Which coefficients are optimized; index `p * (order_x + 1) + q`
    /// for the term `u^p v^q`.
    pub free: Vec<bool>,
}

impl Region {
    pub fn n_coeffs(&self) -> usize {
        (self.order_y + 1) * (self.order_x + 1)
    }

    pub fn n_free(&self) -> usize {
        self.free.iter().filter(|&&f| f).count()
    }

    fn param_range(&self) -> Range<usize> {
        self.offset..self.offset + self.n_coeffs()
    }

    /// Local coordinates in `[-1, 1]`.
    fn local(&self, row: usize, col: usize) -> (f64, f64) {
        (
            normalise(row, self.rows.0, self.rows.1),
            normalise(col, self.cols.0, self.cols.1),
        )
    }

    fn basis(&self, row: usize, col: usize, out: &mut [f64]) {
        let (u, v) = self.local(row, col);
        let mut up = 1.0;
        for p in 0..=self.order_y {
            let mut vq = 1.0;
            for q in 0..=self.order_x {
                out[p * (self.order_x + 1) + q] = up * vq;
                vq *= v;
            }
            up *= u;
        }
    }

    fn value(&self, row: usize, col: usize, coeffs: &[f64], scratch: &mut [f64]) -> f64 {
        self.basis(row, col, scratch);
        scratch.iter().zip(coeffs).map(|(b, c)| b * c).sum()
    }
}

fn normalise(i: usize, lo: usize, hi: usize) -> f64 {
    let len = hi - lo;
    if len <= 1 {
        0.0
    } else {
        2.0 * (i - lo) as f64 / (len - 1) as f64 - 1.0
    }
}

/// Result of fitting one image.
#[derive(Clone, Debug)]
pub struct BackgroundFit {
    /// Coefficients on the original image scale.
    pub params: Vec<f64>,
    /// Reduced chi-square over the pixels used in the fit.
    pub gof: f64,
    /// Number of pixels used.
    pub n_fit: usize,
    /// Median used to normalise the image.
    pub scale: f64,
}

/// Piecewise polynomial background surface over a grid of regions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackgroundModel {
    frame_shape: (usize, usize),
    orders: SplineOrders,
    knots: Knots,
    regions: Vec<Region>,
}

impl BackgroundModel {
    /// Model with evenly spaced knots and every coefficient free.
    pub fn new(frame_shape: (usize, usize), orders: SplineOrders) -> Result<Self> {
        let knots = Knots::uniform(frame_shape, orders.y.len(), orders.x.len());
        let mut model = Self {
            frame_shape,
            orders,
            knots: knots.clone(),
            regions: Vec::new(),
        };
        model.set_knots(knots, false)?;
        Ok(model)
    }

    pub fn frame_shape(&self) -> (usize, usize) {
        self.frame_shape
    }

    pub fn orders(&self) -> &SplineOrders {
        &self.orders
    }

    pub fn knots(&self) -> &Knots {
        &self.knots
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn n_regions(&self) -> usize {
        self.regions.len()
    }

    /// Total number of coefficients; constant for a given set of orders.
    pub fn dof(&self) -> usize {
        self.regions.iter().map(Region::n_coeffs).sum()
    }

    pub fn n_free(&self) -> usize {
        self.regions.iter().map(Region::n_free).sum()
    }

    /// Check that `knots` are increasing and leave each segment long enough.
    pub fn validate_knots(&self, knots: &Knots) -> std::result::Result<(), FitError> {
        let (h, w) = self.frame_shape;
        check_axis("row", &knots.breaks_y(h), &self.orders.y)?;
        check_axis("column", &knots.breaks_x(w), &self.orders.x)
    }

    /// Move the knots. With `preserve_labels` the free-parameter masks are
    /// kept; otherwise every coefficient becomes free again.
    pub fn set_knots(&mut self, knots: Knots, preserve_labels: bool) -> Result<()> {
        self.validate_knots(&knots)?;
        let (h, w) = self.frame_shape;
        let by = knots.breaks_y(h);
        let bx = knots.breaks_x(w);
        let nx = self.orders.x.len();

        let mut regions = Vec::with_capacity(self.orders.y.len() * nx);
        let mut offset = 0;
        for (a, &oy) in self.orders.y.iter().enumerate() {
            for (b, &ox) in self.orders.x.iter().enumerate() {
                let label = (a * nx + b + 1) as u32;
                let n = (oy + 1) * (ox + 1);
                let free = match self.regions.get(label as usize - 1) {
                    Some(old) if preserve_labels && old.free.len() == n => old.free.clone(),
                    _ => vec![true; n],
                };
                regions.push(Region {
                    label,
                    rows: (by[a], by[a + 1]),
                    cols: (bx[b], bx[b + 1]),
                    order_y: oy,
                    order_x: ox,
                    offset,
                    free,
                });
                offset += n;
            }
        }
        self.regions = regions;
        self.knots = knots;
        Ok(())
    }

    /// Copy of the model with different knots and the same masks.
    pub fn with_knots(&self, knots: Knots) -> Result<Self> {
        let mut model = self.clone();
        model.set_knots(knots, true)?;
        Ok(model)
    }

    /// Limit the four corner regions to terms of total degree at most
    /// `max_degree`. Corners are poorly constrained at high order.
    pub fn restrict_corners(&mut self, max_degree: usize) {
        let ny = self.orders.y.len();
        let nx = self.orders.x.len();
        for region in self.regions.iter_mut() {
            let a = (region.label as usize - 1) / nx;
            let b = (region.label as usize - 1) % nx;
            let corner = (a == 0 || a + 1 == ny) && (b == 0 || b + 1 == nx);
            if !corner {
                continue;
            }
            for p in 0..=region.order_y {
                for q in 0..=region.order_x {
                    region.free[p * (region.order_x + 1) + q] = p + q <= max_degree;
                }
            }
        }
    }

    /// Label image of the regions.
    pub fn base_segm(&self) -> SegmentationImage {
        let mut data = Array2::<u32>::zeros(self.frame_shape);
        for region in &self.regions {
            for r in region.rows.0..region.rows.1 {
                for c in region.cols.0..region.cols.1 {
                    data[[r, c]] = region.label;
                }
            }
        }
        SegmentationImage::new(data)
    }

    /// Region labels with `objects` merged on top. Object pixels receive
    /// labels above the region range and are excluded from fits.
    pub fn update_segments(&self, objects: &Array2<u32>) -> Result<(SegmentationImage, LabelMap)> {
        self.base_segm().with_segments(objects)
    }

    /// Evaluate the surface for `params`.
    pub fn evaluate(&self, params: &[f64]) -> Array2<f64> {
        let mut out = Array2::<f64>::from_elem(self.frame_shape, f64::NAN);
        if params.len() != self.dof() {
            return out;
        }
        let max_n = self.regions.iter().map(Region::n_coeffs).max().unwrap_or(0);
        let mut scratch = vec![0.0; max_n];
        for region in &self.regions {
            let coeffs = &params[region.param_range()];
            let scratch = &mut scratch[..region.n_coeffs()];
            for r in region.rows.0..region.rows.1 {
                for c in region.cols.0..region.cols.1 {
                    out[[r, c]] = region.value(r, c, coeffs, scratch);
                }
            }
        }
        out
    }

    /// `image - model(params)`, NaN where the image is not finite.
    pub fn residuals(&self, image: &ArrayView2<f64>, params: &[f64]) -> Array2<f64> {
        let mut out = self.evaluate(params);
        ndarray::Zip::from(&mut out)
            .and(image)
            .for_each(|m, &v| *m = if v.is_finite() { v - *m } else { f64::NAN });
        out
    }

    /// Fit the surface to `image`, ignoring pixels covered by `objects`.
    ///
    /// The image is normalised by its median before fitting and the
    /// coefficients are scaled back. `p0` (original scale) seeds the
    /// minimizer and supplies the values of fixed coefficients.
    pub fn fit(
        &self,
        image: &ArrayView2<f64>,
        objects: &Array2<u32>,
        minimizer: &Minimizer,
        p0: Option<&[f64]>,
    ) -> std::result::Result<BackgroundFit, FitError> {
        let (segm, _) = self
            .update_segments(objects)
            .map_err(|e| FitError::InvalidKnots(e.to_string()))?;
        let scale = nan_median(image.iter().copied());
        if !scale.is_finite() || scale == 0.0 {
            return Err(FitError::BadScale(scale));
        }

        let p0 = p0.filter(|p| p.len() == self.dof());
        let mut params = vec![0.0; self.dof()];
        let mut sum_sq = 0.0;
        let mut n_fit = 0usize;
        for region in &self.regions {
            let pixels: Vec<(usize, usize)> = (region.rows.0..region.rows.1)
                .flat_map(|r| (region.cols.0..region.cols.1).map(move |c| (r, c)))
                .filter(|&(r, c)| segm.data()[[r, c]] == region.label && image[[r, c]].is_finite())
                .collect();
            let n_free = region.n_free();
            if pixels.len() <= n_free {
                return Err(FitError::InsufficientData {
                    region: region.label,
                    available: pixels.len(),
                    required: n_free + 1,
                });
            }

            let n = region.n_coeffs();
            let mut design = Array2::<f64>::zeros((pixels.len(), n));
            let mut y = Vec::with_capacity(pixels.len());
            for (i, &(r, c)) in pixels.iter().enumerate() {
                if let Some(row) = design.row_mut(i).as_slice_mut() {
                    region.basis(r, c, row);
                }
                y.push(image[[r, c]] / scale);
            }

            let start: Option<Vec<f64>> =
                p0.map(|p| p[region.param_range()].iter().map(|v| v / scale).collect());
            let problem = LinearProblem {
                design: design.view(),
                y: &y,
                free: &region.free,
            };
            let solution = problem.minimize(minimizer, start.as_deref())?;

            sum_sq += solution.cost * scale * scale;
            n_fit += pixels.len();
            for (dst, src) in params[region.param_range()].iter_mut().zip(&solution.params) {
                *dst = src * scale;
            }
        }

        let dof_free = self.n_free();
        let gof = sum_sq / (n_fit - dof_free) as f64;
        if !gof.is_finite() {
            return Err(FitError::NonFinite);
        }
        debug!(n_fit, gof, minimizer = minimizer.name(), "Background fit");
        Ok(BackgroundFit {
            params,
            gof,
            n_fit,
            scale,
        })
    }
}

fn check_axis(axis: &str, breaks: &[usize], orders: &[usize]) -> std::result::Result<(), FitError> {
    if breaks.len() != orders.len() + 1 {
        return Err(FitError::InvalidKnots(format!(
            "{} {axis} knots for {} segments",
            breaks.len().saturating_sub(2),
            orders.len()
        )));
    }
    for (k, (pair, &order)) in breaks.windows(2).zip(orders).enumerate() {
        if pair[1] < pair[0] + min_segment(order) {
            return Err(FitError::InvalidKnots(format!(
                "{axis} segment {k} spans {}..{}, needs at least {} pixels",
                pair[0],
                pair[1],
                min_segment(order)
            )));
        }
    }
    Ok(())
}
