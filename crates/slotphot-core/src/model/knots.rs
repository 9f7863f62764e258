use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::consts::{DEFAULT_KNOT_SEARCH_PASSES, DEFAULT_KNOT_SEARCH_STEPS};
use crate::error::FitError;
use crate::model::solver::{LmConfig, Minimizer};
use crate::model::spline::{min_segment, BackgroundModel, Knots};
use crate::stats::nan_median;

/// How a fit obtains its knots.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnotMode {
    /// Place knots from the image's large-scale structure.
    Guess,
    /// Search around the current knots for the placement with least residual.
    Optimize,
    /// Use these knots as given.
    Fixed(Knots),
}

/// Parameters of the knot search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnotSearch {
    /// Step sizes tried around each knot, coarse to fine.
    pub steps: Vec<usize>,
    /// Maximum coordinate-descent passes per step size.
    pub passes: usize,
}

impl Default for KnotSearch {
    fn default() -> Self {
        Self {
            steps: DEFAULT_KNOT_SEARCH_STEPS.to_vec(),
            passes: DEFAULT_KNOT_SEARCH_PASSES,
        }
    }
}

/// Heuristic knots: start from an even split and move each knot toward the
/// strongest curvature of the median profile along its axis, within a
/// quarter segment. Pixels covered by `objects` are ignored.
pub fn guess_knots(model: &BackgroundModel, image: &ArrayView2<f64>, objects: &Array2<u32>) -> Knots {
    let (h, w) = model.frame_shape();
    let orders = model.orders();
    let uniform = Knots::uniform((h, w), orders.y.len(), orders.x.len());

    let clean = ndarray::Zip::from(image)
        .and(objects)
        .map_collect(|&v, &l| if l == 0 { v } else { f64::NAN });
    let row_profile: Vec<f64> = clean
        .axis_iter(Axis(0))
        .map(|row| nan_median(row.iter().copied()))
        .collect();
    let col_profile: Vec<f64> = clean
        .axis_iter(Axis(1))
        .map(|col| nan_median(col.iter().copied()))
        .collect();

    let knots = Knots {
        y: place_on_profile(&row_profile, &uniform.y, &orders.y),
        x: place_on_profile(&col_profile, &uniform.x, &orders.x),
    };
    match model.validate_knots(&knots) {
        Ok(()) => knots,
        Err(_) => uniform,
    }
}

fn place_on_profile(profile: &[f64], start: &[usize], orders: &[usize]) -> Vec<usize> {
    let n = profile.len();
    if n < 5 {
        return start.to_vec();
    }
    let curvature: Vec<f64> = (0..n)
        .map(|i| {
            if i == 0 || i + 1 == n {
                return 0.0;
            }
            let c = profile[i - 1] - 2.0 * profile[i] + profile[i + 1];
            if c.is_finite() {
                c.abs()
            } else {
                0.0
            }
        })
        .collect();
    let breaks: Vec<usize> = std::iter::once(0)
        .chain(start.iter().copied())
        .chain(std::iter::once(n))
        .collect();

    let mut placed = Vec::with_capacity(start.len());
    let mut prev = 0usize;
    for (k, &knot) in start.iter().enumerate() {
        let seg = breaks[k + 2] - breaks[k];
        let reach = seg / 8;
        let lo = knot
            .saturating_sub(reach)
            .max(prev + min_segment(orders[k]));
        let hi = (knot + reach).min(n.saturating_sub(min_segment(orders[k + 1])));
        let best = (lo..=hi)
            .filter(|&i| i < n)
            .max_by(|&a, &b| {
                curvature[a]
                    .partial_cmp(&curvature[b])
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .filter(|&i| curvature[i] > 0.0)
            .unwrap_or(knot);
        placed.push(best);
        prev = best;
    }
    placed
}

/// Sum of squared residuals of a plain least-squares fit with `knots`.
fn knot_cost(
    model: &BackgroundModel,
    knots: &Knots,
    image: &ArrayView2<f64>,
    objects: &Array2<u32>,
) -> Option<f64> {
    let candidate = model.with_knots(knots.clone()).ok()?;
    let minimizer = Minimizer::LevenbergMarquardt(LmConfig::default());
    let fit = candidate.fit(image, objects, &minimizer, None).ok()?;
    Some(fit.gof * (fit.n_fit - candidate.n_free()) as f64)
}

/// Coordinate descent over the interior knots. Each knot is nudged by every
/// step size in turn; a move is kept when it lowers the residual sum of
/// squares. Fails when no valid starting configuration can be fitted.
pub fn optimize_knots(
    model: &BackgroundModel,
    image: &ArrayView2<f64>,
    objects: &Array2<u32>,
    search: &KnotSearch,
) -> Result<Knots, FitError> {
    let mut best = model.knots().clone();
    let mut best_cost = knot_cost(model, &best, image, objects).ok_or_else(|| {
        FitError::InvalidKnots("starting knots cannot be fitted".to_string())
    })?;
    let n_y = best.y.len();

    for &step in &search.steps {
        for _ in 0..search.passes.max(1) {
            let mut improved = false;
            for k in 0..best.len() {
                for dir in [-1isize, 1] {
                    let mut trial = best.clone();
                    let slot = if k < n_y {
                        &mut trial.y[k]
                    } else {
                        &mut trial.x[k - n_y]
                    };
                    let moved = *slot as isize + dir * step as isize;
                    if moved <= 0 {
                        continue;
                    }
                    *slot = moved as usize;
                    if model.validate_knots(&trial).is_err() {
                        continue;
                    }
                    if let Some(cost) = knot_cost(model, &trial, image, objects) {
                        if cost < best_cost {
                            best = trial;
                            best_cost = cost;
                            improved = true;
                        }
                    }
                }
            }
            if !improved {
                break;
            }
        }
    }
    debug!(knots = ?best, cost = best_cost, "Knot search finished");
    Ok(best)
}

/// Resolve `mode` into concrete knots for `model`.
pub fn resolve_knots(
    mode: &KnotMode,
    model: &BackgroundModel,
    image: &ArrayView2<f64>,
    objects: &Array2<u32>,
    search: &KnotSearch,
) -> Result<Knots, FitError> {
    match mode {
        KnotMode::Guess => Ok(guess_knots(model, image, objects)),
        KnotMode::Optimize => optimize_knots(model, image, objects, search),
        KnotMode::Fixed(knots) => {
            model.validate_knots(knots)?;
            Ok(knots.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::spline::SplineOrders;

    #[test]
    fn test_optimize_finds_step_edge() {
        // Two flat levels meeting at row 20; order 0 segments can only fit
        // this exactly with the knot on the edge.
        let orders = SplineOrders {
            y: vec![0, 0],
            x: vec![0],
        };
        let mut model = BackgroundModel::new((40, 10), orders).unwrap();
        model
            .set_knots(Knots { y: vec![12], x: vec![] }, false)
            .unwrap();
        let image = Array2::from_shape_fn((40, 10), |(r, _)| if r < 20 { 10.0 } else { 30.0 });
        let objects = Array2::<u32>::zeros((40, 10));
        let search = KnotSearch {
            steps: vec![8, 4, 2, 1],
            passes: 3,
        };
        let knots = optimize_knots(&model, &image.view(), &objects, &search).unwrap();
        assert_eq!(knots.y, vec![20]);
    }

    #[test]
    fn test_fixed_knots_validated() {
        let orders = SplineOrders {
            y: vec![1, 1],
            x: vec![1],
        };
        let model = BackgroundModel::new((20, 10), orders).unwrap();
        let image = Array2::<f64>::ones((20, 10));
        let objects = Array2::<u32>::zeros((20, 10));
        let search = KnotSearch {
            steps: vec![2],
            passes: 1,
        };
        let bad = KnotMode::Fixed(Knots { y: vec![1], x: vec![] });
        assert!(resolve_knots(&bad, &model, &image.view(), &objects, &search).is_err());
        let good = KnotMode::Fixed(Knots { y: vec![10], x: vec![] });
        assert_eq!(
            resolve_knots(&good, &model, &image.view(), &objects, &search).unwrap().y,
            vec![10]
        );
    }
}
