//! Least-squares minimizers for models linear in their coefficients.
//!
//! Two strategies are offered: a Huber-weighted iteratively reweighted least
//! squares fit that tolerates outliers such as cosmic rays, and a
//! Levenberg-Marquardt fit that is faster but assumes clean data.

use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::consts::{HUBER_K, MAD_TO_SIGMA};
use crate::error::FitError;
use crate::stats::median_in_place;

/// Smallest pivot accepted by the linear solver.
const PIVOT_EPSILON: f64 = 1e-12;

/// Configuration for Levenberg-Marquardt optimization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LmConfig {
    pub max_iterations: usize,
    /// Convergence threshold for the largest parameter change.
    pub convergence_threshold: f64,
    pub initial_lambda: f64,
    pub lambda_up: f64,
    pub lambda_down: f64,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            convergence_threshold: 1e-8,
            initial_lambda: 0.001,
            lambda_up: 10.0,
            lambda_down: 0.1,
        }
    }
}

/// Configuration for Huber IRLS.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IrlsConfig {
    pub max_iterations: usize,
    /// Stop when the largest parameter change relative to the largest
    /// parameter falls below this.
    pub tolerance: f64,
    /// Huber threshold in units of the robust residual scale.
    pub huber_k: f64,
}

impl Default for IrlsConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-6,
            huber_k: HUBER_K,
        }
    }
}

/// Minimizer used for a fit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Minimizer {
    /// Outlier-robust Huber IRLS.
    Robust(IrlsConfig),
    /// Levenberg-Marquardt, started from the supplied initial guess.
    LevenbergMarquardt(LmConfig),
}

impl Minimizer {
    pub fn robust() -> Self {
        Self::Robust(IrlsConfig::default())
    }

    pub fn levenberg_marquardt() -> Self {
        Self::LevenbergMarquardt(LmConfig::default())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Robust(_) => "robust",
            Self::LevenbergMarquardt(_) => "lm",
        }
    }
}

/// Result of a minimization.
#[derive(Clone, Debug)]
pub struct Solution {
    pub params: Vec<f64>,
    /// Unweighted sum of squared residuals.
    pub cost: f64,
    pub iterations: usize,
}

/// Solve `a x = b` by Gaussian elimination with partial pivoting.
///
/// Returns `None` if the matrix is singular (pivot too small).
pub fn solve(mut a: Array2<f64>, mut b: Array1<f64>) -> Option<Array1<f64>> {
    let n = b.len();
    for col in 0..n {
        let mut max_row = col;
        let mut max_val = a[[col, col]].abs();
        for row in (col + 1)..n {
            if a[[row, col]].abs() > max_val {
                max_val = a[[row, col]].abs();
                max_row = row;
            }
        }
        if max_val < PIVOT_EPSILON || !max_val.is_finite() {
            return None;
        }

        if max_row != col {
            for j in 0..n {
                a.swap([col, j], [max_row, j]);
            }
            b.swap(col, max_row);
        }

        for row in (col + 1)..n {
            let factor = a[[row, col]] / a[[col, col]];
            if factor == 0.0 {
                continue;
            }
            for j in col..n {
                a[[row, j]] -= factor * a[[col, j]];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = b[i];
        for j in (i + 1)..n {
            sum -= a[[i, j]] * x[j];
        }
        x[i] = sum / a[[i, i]];
    }
    Some(x)
}

/// A linear least-squares problem `y ~ A p` with some coefficients held fixed.
pub struct LinearProblem<'a> {
    /// `(n_points, n_params)` design matrix.
    pub design: ArrayView2<'a, f64>,
    pub y: &'a [f64],
    /// Which coefficients are optimized. Fixed ones keep their initial value.
    pub free: &'a [bool],
}

impl LinearProblem<'_> {
    fn n_params(&self) -> usize {
        self.design.ncols()
    }

    fn free_indices(&self) -> Vec<usize> {
        (0..self.n_params()).filter(|&j| self.free[j]).collect()
    }

    fn residuals(&self, params: &[f64]) -> Vec<f64> {
        self.design
            .rows()
            .into_iter()
            .zip(self.y)
            .map(|(row, &y)| y - row.iter().zip(params).map(|(a, p)| a * p).sum::<f64>())
            .collect()
    }

    fn cost(&self, params: &[f64]) -> f64 {
        self.residuals(params).iter().map(|r| r * r).sum()
    }

    /// Weighted normal equations `(J^T W J, J^T W r)` over the free columns.
    fn normal_equations(
        &self,
        cols: &[usize],
        residuals: &[f64],
        weights: Option<&[f64]>,
    ) -> (Array2<f64>, Array1<f64>) {
        let m = cols.len();
        let mut hessian = Array2::<f64>::zeros((m, m));
        let mut gradient = Array1::<f64>::zeros(m);
        for (i, row) in self.design.rows().into_iter().enumerate() {
            let w = weights.map_or(1.0, |w| w[i]);
            if w == 0.0 {
                continue;
            }
            for (a, &ca) in cols.iter().enumerate() {
                let ja = row[ca] * w;
                if ja == 0.0 {
                    continue;
                }
                gradient[a] += ja * residuals[i];
                for (b, &cb) in cols.iter().enumerate().skip(a) {
                    hessian[[a, b]] += ja * row[cb];
                }
            }
        }
        for a in 0..m {
            for b in 0..a {
                hessian[[a, b]] = hessian[[b, a]];
            }
        }
        (hessian, gradient)
    }

    /// Minimize with `minimizer`, starting from `p0` (zeros when absent).
    pub fn minimize(&self, minimizer: &Minimizer, p0: Option<&[f64]>) -> Result<Solution, FitError> {
        let start: Vec<f64> = match p0 {
            Some(p) if p.len() == self.n_params() && p.iter().all(|v| v.is_finite()) => p.to_vec(),
            _ => vec![0.0; self.n_params()],
        };
        let solution = match minimizer {
            Minimizer::Robust(cfg) => self.irls(start, cfg)?,
            Minimizer::LevenbergMarquardt(cfg) => self.levenberg_marquardt(start, cfg)?,
        };
        if solution.params.iter().any(|p| !p.is_finite()) || !solution.cost.is_finite() {
            return Err(FitError::NonFinite);
        }
        Ok(solution)
    }

    /// Plain (optionally weighted) least squares for the free coefficients.
    fn weighted_lstsq(&self, start: &[f64], weights: Option<&[f64]>) -> Result<Vec<f64>, FitError> {
        let cols = self.free_indices();
        let residuals = self.residuals(start);
        let (hessian, gradient) = self.normal_equations(&cols, &residuals, weights);
        let delta = solve(hessian, gradient).ok_or(FitError::Singular)?;
        let mut params = start.to_vec();
        for (k, &c) in cols.iter().enumerate() {
            params[c] += delta[k];
        }
        Ok(params)
    }

    fn levenberg_marquardt(&self, start: Vec<f64>, config: &LmConfig) -> Result<Solution, FitError> {
        let cols = self.free_indices();
        let mut params = start;
        let mut lambda = config.initial_lambda;
        let mut prev_cost = self.cost(&params);

        for iter in 0..config.max_iterations {
            let residuals = self.residuals(&params);
            let (hessian, gradient) = self.normal_equations(&cols, &residuals, None);

            let mut damped = hessian;
            for i in 0..cols.len() {
                damped[[i, i]] *= 1.0 + lambda;
            }
            let delta = solve(damped, gradient).ok_or(FitError::Singular)?;
            let max_delta = delta.iter().fold(0.0f64, |a, d| a.max(d.abs()));

            let mut candidate = params.clone();
            for (k, &c) in cols.iter().enumerate() {
                candidate[c] += delta[k];
            }
            let new_cost = self.cost(&candidate);

            if new_cost <= prev_cost {
                params = candidate;
                prev_cost = new_cost;
                lambda *= config.lambda_down;
                if max_delta < config.convergence_threshold {
                    return Ok(Solution {
                        params,
                        cost: prev_cost,
                        iterations: iter + 1,
                    });
                }
            } else {
                if max_delta < config.convergence_threshold {
                    return Ok(Solution {
                        params,
                        cost: prev_cost,
                        iterations: iter + 1,
                    });
                }
                lambda *= config.lambda_up;
                if lambda > 1e10 {
                    break;
                }
            }
        }
        Err(FitError::NotConverged {
            iterations: config.max_iterations,
        })
    }

    fn irls(&self, start: Vec<f64>, config: &IrlsConfig) -> Result<Solution, FitError> {
        let mut params = self.weighted_lstsq(&start, None)?;
        let mut weights = vec![1.0; self.y.len()];

        for iter in 0..config.max_iterations {
            let residuals = self.residuals(&params);
            let mut abs: Vec<f64> = residuals.iter().map(|r| r.abs()).collect();
            let scale = median_in_place(&mut abs) * MAD_TO_SIGMA;
            if scale.is_nan() || scale <= 0.0 {
                return Ok(Solution {
                    cost: self.cost(&params),
                    params,
                    iterations: iter + 1,
                });
            }
            let delta = config.huber_k * scale;
            for (w, r) in weights.iter_mut().zip(&residuals) {
                *w = huber_weight(*r, delta);
            }

            let updated = self.weighted_lstsq(&params, Some(&weights))?;
            let change = updated
                .iter()
                .zip(&params)
                .fold(0.0f64, |a, (u, p)| a.max((u - p).abs()));
            let magnitude = updated.iter().fold(0.0f64, |a, p| a.max(p.abs()));
            params = updated;
            if change <= config.tolerance * (1.0 + magnitude) {
                return Ok(Solution {
                    cost: self.cost(&params),
                    params,
                    iterations: iter + 1,
                });
            }
        }
        Err(FitError::NotConverged {
            iterations: config.max_iterations,
        })
    }
}

fn huber_weight(residual: f64, delta: f64) -> f64 {
    let abs = residual.abs();
    if abs <= delta {
        1.0
    } else {
        delta / abs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn line_problem() -> (Array2<f64>, Vec<f64>) {
        let xs: Vec<f64> = (0..20).map(|i| i as f64 / 10.0 - 1.0).collect();
        let design = Array2::from_shape_fn((20, 2), |(i, j)| if j == 0 { 1.0 } else { xs[i] });
        let y = xs.iter().map(|x| 2.0 + 3.0 * x).collect();
        (design, y)
    }

    #[test]
    fn test_solve_3x3() {
        let a = array![[2.0, 1.0, -1.0], [-3.0, -1.0, 2.0], [-2.0, 1.0, 2.0]];
        let b = array![8.0, -11.0, -3.0];
        let x = solve(a, b).unwrap();
        assert_abs_diff_eq!(x[0], 2.0, epsilon = 1e-10);
        assert_abs_diff_eq!(x[1], 3.0, epsilon = 1e-10);
        assert_abs_diff_eq!(x[2], -1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_singular_returns_none() {
        let a = array![[1.0, 2.0], [2.0, 4.0]];
        assert!(solve(a, array![1.0, 2.0]).is_none());
    }

    #[test]
    fn test_lm_recovers_line() {
        let (design, y) = line_problem();
        let free = [true, true];
        let problem = LinearProblem {
            design: design.view(),
            y: &y,
            free: &free,
        };
        let sol = problem.minimize(&Minimizer::levenberg_marquardt(), None).unwrap();
        assert_abs_diff_eq!(sol.params[0], 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(sol.params[1], 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_robust_ignores_outlier() {
        let (design, mut y) = line_problem();
        y[5] += 100.0;
        let free = [true, true];
        let problem = LinearProblem {
            design: design.view(),
            y: &y,
            free: &free,
        };
        let sol = problem.minimize(&Minimizer::robust(), None).unwrap();
        assert!((sol.params[0] - 2.0).abs() < 0.1, "intercept {}", sol.params[0]);
        assert!((sol.params[1] - 3.0).abs() < 0.1, "slope {}", sol.params[1]);
    }

    #[test]
    fn test_fixed_parameter_held() {
        let (design, y) = line_problem();
        let free = [false, true];
        let problem = LinearProblem {
            design: design.view(),
            y: &y,
            free: &free,
        };
        let sol = problem
            .minimize(&Minimizer::levenberg_marquardt(), Some(&[2.0, 0.0]))
            .unwrap();
        assert_eq!(sol.params[0], 2.0);
        assert_abs_diff_eq!(sol.params[1], 3.0, epsilon = 1e-6);
    }
}
