use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;

use crate::consts::PARALLEL_PIXEL_THRESHOLD;
use crate::error::{PhotError, Result};
use crate::stats::median_in_place;

/// Stack frames by computing the NaN-aware median at each pixel position.
///
/// Pixels where every frame is NaN stay NaN. Parallelizes at the row level
/// for images >= 256x256.
pub fn median_stack(frames: &[ArrayView2<f64>]) -> Result<Array2<f64>> {
    if frames.is_empty() {
        return Err(PhotError::EmptySequence);
    }

    let (h, w) = frames[0].dim();
    if let Some(bad) = frames.iter().find(|f| f.dim() != (h, w)) {
        return Err(PhotError::LabelShapeMismatch {
            expected: (h, w),
            found: bad.dim(),
        });
    }
    let n = frames.len();

    let median_row = |row: usize, out: &mut [f64], scratch: &mut Vec<f64>| {
        for (col, result) in out.iter_mut().enumerate() {
            scratch.clear();
            scratch.extend(
                frames
                    .iter()
                    .map(|f| f[[row, col]])
                    .filter(|v| v.is_finite()),
            );
            *result = median_in_place(scratch);
        }
    };

    let mut result = Array2::<f64>::from_elem((h, w), f64::NAN);
    if h * w >= PARALLEL_PIXEL_THRESHOLD && n > 1 {
        result
            .axis_iter_mut(ndarray::Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each_init(
                || Vec::with_capacity(n),
                |scratch, (row, mut out)| {
                    if let Some(slice) = out.as_slice_mut() {
                        median_row(row, slice, scratch);
                    }
                },
            );
    } else {
        let mut scratch = Vec::with_capacity(n);
        for (row, mut out) in result.axis_iter_mut(ndarray::Axis(0)).enumerate() {
            if let Some(slice) = out.as_slice_mut() {
                median_row(row, slice, &mut scratch);
            }
        }
    }
    Ok(result)
}
