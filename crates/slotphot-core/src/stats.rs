//! Small NaN-aware statistics shared by detection, fitting and tracking.

use ndarray::{Array2, ArrayView2};
use num_traits::Float;

use crate::consts::MAD_TO_SIGMA;

/// Median of a scratch buffer, reordering it in place.
///
/// Uses `select_nth_unstable` for O(n) median without full sort.
/// Returns NaN for an empty buffer.
pub fn median_in_place<T: Float>(values: &mut [T]) -> T {
    let n = values.len();
    if n == 0 {
        return T::nan();
    }
    if n == 1 {
        return values[0];
    }
    let cmp = |a: &T, b: &T| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal);
    let mid = n / 2;
    if n % 2 == 1 {
        *values.select_nth_unstable_by(mid, cmp).1
    } else {
        values.select_nth_unstable_by(mid, cmp);
        let upper = values[mid];
        values[..mid].select_nth_unstable_by(mid - 1, cmp);
        (values[mid - 1] + upper) / (T::one() + T::one())
    }
}

/// Median of the finite values produced by `values`. NaN when none are finite.
pub fn nan_median<I: IntoIterator<Item = f64>>(values: I) -> f64 {
    let mut finite: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
    median_in_place(&mut finite)
}

/// Median of the finite pixels of an image.
pub fn image_median(image: &ArrayView2<f64>) -> f64 {
    nan_median(image.iter().copied())
}

/// Median and MAD-based standard deviation of the finite values.
pub fn median_mad_std(values: &[f64]) -> Option<(f64, f64)> {
    let mut finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    let median = median_in_place(&mut finite);
    for v in finite.iter_mut() {
        *v = (*v - median).abs();
    }
    let mad = median_in_place(&mut finite);
    Some((median, mad * MAD_TO_SIGMA))
}

/// Sigma-clipped median and standard deviation.
///
/// Per pass: compute median and robust sigma, reject values more than `sigma`
/// standard deviations from the median, then recompute from the survivors.
/// Non-finite values are ignored. Returns `None` when nothing finite remains.
pub fn sigma_clipped_stats(values: &[f64], sigma: f64, iterations: usize) -> Option<(f64, f64)> {
    let mut kept: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if kept.is_empty() {
        return None;
    }

    let (mut median, mut std) = median_mad_std(&kept)?;
    for _ in 0..iterations {
        if std <= 0.0 {
            break;
        }
        let lo = median - sigma * std;
        let hi = median + sigma * std;
        let before = kept.len();
        kept.retain(|&v| v >= lo && v <= hi);
        if kept.is_empty() {
            break;
        }
        (median, std) = median_mad_std(&kept)?;
        if kept.len() == before {
            break;
        }
    }
    Some((median, std))
}

/// Values of `image` where `select` is true and the pixel is finite.
pub fn masked_values(image: &ArrayView2<f64>, select: &Array2<bool>) -> Vec<f64> {
    image
        .iter()
        .zip(select.iter())
        .filter(|&(v, &s)| s && v.is_finite())
        .map(|(&v, _)| v)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd_even() {
        assert_eq!(median_in_place(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median_in_place(&mut [4.0, 1.0, 3.0, 2.0]), 2.5);
        assert!(median_in_place::<f64>(&mut []).is_nan());
    }

    #[test]
    fn test_nan_median_skips_nan() {
        let m = nan_median([f64::NAN, 1.0, 5.0, f64::NAN, 3.0]);
        assert_eq!(m, 3.0);
        assert!(nan_median([f64::NAN]).is_nan());
    }

    #[test]
    fn test_sigma_clip_rejects_outlier() {
        let mut values = vec![10.0; 50];
        for (i, v) in values.iter_mut().enumerate() {
            *v += (i % 5) as f64 * 0.1;
        }
        values.push(1000.0);
        let (median, std) = sigma_clipped_stats(&values, 3.0, 3).unwrap();
        assert!((median - 10.2).abs() < 1e-9);
        assert!(std < 1.0);
    }
}
